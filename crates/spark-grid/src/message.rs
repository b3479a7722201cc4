//! 成员之间交换的消息。
//!
//! 每个请求消息携带发送方轮询的标识；接收方把它记在响应里原样带回，发送方据此找到对应的轮询。
//! 发送方专用的字段（链式请求的来源回指、响应句柄）在投递前被剥离，不会出现在线上。

use core::fmt;

use bytes::Bytes;

use crate::{
    error::RemoteFailure,
    member::MemberId,
    request::{
        ChainedRequest, KeyRequest, LeaseGrant, LeaseRequest, PartialResponse, PartitionedRequest,
    },
};

/// 轮询标识，在发送方节点内唯一。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PollId(u64);

impl PollId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PollId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poll-{}", self.0)
    }
}

/// 请求的调度属性，由外部调度器消费。
///
/// - `scheduling_priority`：数值越大越先被工作线程处理；
/// - `request_timeout_millis`：发送方等待响应的时限，超时等同于待响应成员全部离开，0 表示使用节点默认值；
/// - `execution_timeout_millis`：接收方排队等待处理的时限，超过后以失败响应，0 表示不限。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RequestOptions {
    pub scheduling_priority: i32,
    pub request_timeout_millis: u64,
    pub execution_timeout_millis: u64,
}

/// 四类请求。
#[derive(Clone, Debug)]
pub enum Request {
    Chained(ChainedRequest),
    Key(KeyRequest),
    Partitioned(PartitionedRequest),
    Lease(LeaseRequest),
}

impl Request {
    pub fn options(&self) -> RequestOptions {
        match self {
            Request::Chained(request) => request.options,
            Request::Key(request) => request.options,
            Request::Partitioned(request) => request.options,
            Request::Lease(request) => request.options,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Chained(_) => "chained",
            Request::Key(_) => "key",
            Request::Partitioned(_) => "partitioned",
            Request::Lease(_) => "lease",
        }
    }
}

/// 响应。
///
/// `NotOwner` 表示接收方不再拥有目标（分区已迁移或自身已不是租约签发者），
/// 发送方将其与“响应方离开”同等对待，按最新归属重试。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ack,
    Value(Option<Bytes>),
    Failure(RemoteFailure),
    Partial(PartialResponse),
    Lease(LeaseGrant),
    NotOwner,
}

#[derive(Clone, Debug)]
pub enum MessageBody {
    Request { poll_id: PollId, request: Request },
    Response { poll_id: PollId, response: Response },
}

/// 一条点对点消息。
#[derive(Clone, Debug)]
pub struct Message {
    pub from: MemberId,
    pub to: MemberId,
    pub body: MessageBody,
}

impl Message {
    pub fn request(from: MemberId, to: MemberId, poll_id: PollId, request: Request) -> Self {
        Self {
            from,
            to,
            body: MessageBody::Request { poll_id, request },
        }
    }

    pub fn response(from: MemberId, to: MemberId, poll_id: PollId, response: Response) -> Self {
        Self {
            from,
            to,
            body: MessageBody::Response { poll_id, response },
        }
    }
}
