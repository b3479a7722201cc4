use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::{
    error::{GridError, RemoteFailure},
    handle::ResponseHandle,
    member::{MemberId, MemberSet},
    message::{PollId, Request, RequestOptions, Response},
    node::GridNode,
    poll::{Disposition, PollClosure, RequestPoll},
};

/// 键请求执行的操作。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyOperation {
    Get,
    Put(Bytes),
    Remove,
}

/// 按键路由到分区主拥有者的点对点请求。
///
/// # 教案式说明
/// - **意图 (Why)**：单键读写只需要一个成员答复，路由依据是键所属分区的当前主拥有者；
/// - **逻辑 (How)**：拥有者在答复前离开、超时或答复 `NotOwner` 时，结果为“响应未知”，
///   发送方按最新归属重发，重发次数受 `key_request_retry_limit` 约束；
/// - **契约 (What)**：应用层失败原样返回，不重发；重发预算耗尽时返回 [`GridError::ResponseUnknown`]。
#[derive(Clone, Debug)]
pub struct KeyRequest {
    pub service_id: u32,
    pub cache_id: u64,
    pub key: Bytes,
    pub operation: KeyOperation,
    pub options: RequestOptions,
}

impl KeyRequest {
    pub fn new(cache_id: u64, key: Bytes, operation: KeyOperation) -> Self {
        Self {
            service_id: 0,
            cache_id,
            key,
            operation,
            options: RequestOptions::default(),
        }
    }

    pub fn get(cache_id: u64, key: impl Into<Bytes>) -> Self {
        Self::new(cache_id, key.into(), KeyOperation::Get)
    }

    pub fn put(cache_id: u64, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::new(cache_id, key.into(), KeyOperation::Put(value.into()))
    }

    pub fn remove(cache_id: u64, key: impl Into<Bytes>) -> Self {
        Self::new(cache_id, key.into(), KeyOperation::Remove)
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// 按当前归属发送一次键请求；`attempt` 从 0 开始计数。
pub(crate) fn submit_key(
    node: &GridNode,
    request: KeyRequest,
    handle: Arc<ResponseHandle<Option<Bytes>>>,
    attempt: u32,
) {
    let ownership = node.ownership();
    let partition = ownership.partition_of_key(&request.key);
    let owner = ownership.owner_of(partition);
    let targets: MemberSet = owner.into_iter().collect();
    let options = request.options;
    let wire = owner.map(|owner| (owner, request.clone()));
    let tracker = Box::new(KeyPoll {
        request,
        handle,
        attempt,
        outcome: None,
    });
    if let Some(poll_id) = node.open_poll(targets, &options, tracker) {
        if let Some((owner, request)) = wire {
            debug!(member = %node.member(), %owner, %partition, attempt, poll = %poll_id, "sending key request");
            node.post_request(owner, poll_id, Request::Key(request));
        }
    }
}

/// 拥有者处理键请求；不再拥有键所属分区时答复 `NotOwner`。
pub(crate) fn receive_key(node: &GridNode, from: MemberId, poll_id: PollId, request: KeyRequest) {
    let ownership = node.ownership();
    let partition = ownership.partition_of_key(&request.key);
    let response = if ownership.owner_of(partition) != Some(node.member()) {
        debug!(member = %node.member(), %partition, "rejecting key request for a partition not owned here");
        Response::NotOwner
    } else {
        match node.handler().on_key_request(&request) {
            Ok(value) => Response::Value(value),
            Err(failure) => Response::Failure(failure),
        }
    };
    node.reply(from, poll_id, response);
}

struct KeyPoll {
    request: KeyRequest,
    handle: Arc<ResponseHandle<Option<Bytes>>>,
    attempt: u32,
    outcome: Option<Result<Option<Bytes>, RemoteFailure>>,
}

impl RequestPoll for KeyPoll {
    fn on_response(&mut self, _from: MemberId, response: Response) -> Disposition {
        match response {
            Response::Value(value) => self.outcome = Some(Ok(value)),
            Response::Failure(failure) => self.outcome = Some(Err(failure)),
            _ => {}
        }
        Disposition::CloseNow
    }

    fn on_completion(self: Box<Self>, node: &GridNode, closure: PollClosure) {
        let KeyPoll {
            request,
            handle,
            attempt,
            outcome,
        } = *self;
        if let Some(outcome) = outcome {
            handle.complete(outcome.map_err(GridError::Remote));
            return;
        }
        if !closure.service_state.is_running() {
            handle.complete(Err(GridError::ServiceStopped));
            return;
        }
        if attempt < node.config().key_request_retry_limit {
            debug!(
                member = %node.member(),
                poll = %closure.poll_id,
                attempt = attempt + 1,
                "key request response unknown, retrying against current ownership"
            );
            submit_key(node, request, handle, attempt + 1);
        } else {
            debug!(member = %node.member(), attempt, "key request retry budget exhausted");
            handle.complete(Err(GridError::ResponseUnknown));
        }
    }

    fn describe(&self) -> &'static str {
        "key"
    }
}
