//! # 服务协作者契约
//!
//! ## 角色定位（Why）
//! - 协议核心不持有网络与成员管理，只通过 [`ServiceContext`] 查询成员视图、服务状态并投递消息；
//! - 存储侧的业务处理通过 [`RequestHandler`] 注入，协议只负责路由、轮询与重试。
//!
//! ## 契约（What）
//! - `post` 必须是异步的：调用方不会在同一调用栈中收到对端的响应；
//! - `service_state` 用于在轮询完成时区分“服务已停止”与“成员已离开”。

use bytes::Bytes;

use crate::{
    error::RemoteFailure,
    member::{MemberId, MemberSet},
    message::Message,
    partition::{PartitionId, PartitionSet},
    request::{ChainedRequest, KeyRequest, LeaseGrant, LeaseRequest, PartitionedRequest},
};

/// 所属服务的生命周期状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl ServiceState {
    pub fn is_running(self) -> bool {
        matches!(self, ServiceState::Running)
    }

    /// 判断状态是否允许跃迁至 `target`。
    pub fn can_transition_to(self, target: ServiceState) -> bool {
        matches!(
            (self, target),
            (ServiceState::Starting, ServiceState::Running)
                | (ServiceState::Starting, ServiceState::Stopped)
                | (ServiceState::Running, ServiceState::Stopping)
                | (ServiceState::Running, ServiceState::Stopped)
                | (ServiceState::Stopping, ServiceState::Stopped)
        )
    }
}

/// 传输与成员视图协作者。
///
/// # 教案式说明
/// - **意图 (Why)**：把集群通信抽象为最小接口，使协议可以运行在真实传输或测试用的内存集群上；
/// - **契约 (What)**：
///   - `service_members`：当前运行该服务的成员（含自身）；
///   - `successor_member(of)`：环形顺序中 `of` 之后的下一个存活成员，不存在时返回 `None`；
///   - `oldest_member`：最早加入的存活成员，承担租约签发；
///   - `now_millis`：单调时钟，用于计算请求超时。
pub trait ServiceContext: Send + Sync {
    fn local_member(&self) -> MemberId;

    fn service_state(&self) -> ServiceState;

    fn service_members(&self) -> MemberSet;

    fn successor_member(&self, of: MemberId) -> Option<MemberId> {
        self.service_members().successor_of(of)
    }

    fn oldest_member(&self) -> Option<MemberId> {
        self.service_members().first()
    }

    fn post(&self, message: Message);

    fn now_millis(&self) -> u64;
}

/// 存储侧请求处理器。
///
/// # 设计初衷（Why）
/// - 键请求、多分区请求与租约请求的业务语义由宿主决定，协议层只关心结果或失败；
/// - 链式请求的三个钩子默认为空实现，宿主按需覆盖。
///
/// # 契约定义（What）
/// - `on_partitioned_request` 只会收到本成员当前拥有且归属版本匹配的分区 `owned`；
///   返回的结果条目必须属于 `owned`；
/// - 返回 `Err(RemoteFailure)` 的失败会原样传回调用方。
pub trait RequestHandler: Send + Sync {
    fn on_key_request(&self, request: &KeyRequest) -> Result<Option<Bytes>, RemoteFailure>;

    fn on_partitioned_request(
        &self,
        request: &PartitionedRequest,
        owned: &PartitionSet,
    ) -> Result<Vec<(PartitionId, Bytes)>, RemoteFailure>;

    fn on_lease_request(&self, request: &LeaseRequest) -> Result<LeaseGrant, RemoteFailure>;

    /// 链式请求到达本成员。
    fn on_chain_received(&self, _member: MemberId, _request: &ChainedRequest) {}

    /// 本成员之后的链路已完成，即将向前驱答复。
    fn on_chain_delivered(&self, _member: MemberId, _request: &ChainedRequest) {}

    /// 整条链路已完成，仅在发起者上调用一次。
    fn on_chain_completed(&self, _member: MemberId, _request: &ChainedRequest) {}
}
