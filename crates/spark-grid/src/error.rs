//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 区分三类失败：可重试的“响应未知”（响应方离开或超时）、原样上抛的应用层失败、以及本地的编解码与配置错误；
//! - 应用层失败由远端成员捕获后作为轮询结果传回，调用方检查结果时原样得到，不包装、不重试。
//!
//! ## 契约（What）
//! - [`GridError::is_retryable`] 仅对 `ResponseUnknown` 返回 `true`；
//! - 所有变体满足 `Clone + Send + Sync + 'static`，可以在响应句柄中被多个等待者读取。

use core::fmt;

use thiserror::Error;

use crate::{member::MemberId, partition::PartitionSet};

/// 远端成员在处理请求时产生的应用层失败。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteFailure {
    pub member: MemberId,
    pub message: String,
}

impl RemoteFailure {
    pub fn new(member: MemberId, message: impl Into<String>) -> Self {
        Self {
            member,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed: {}", self.member, self.message)
    }
}

impl std::error::Error for RemoteFailure {}

/// 分布式请求领域的错误枚举。
///
/// # 教案式说明
/// - **意图 (Why)**：让调用方以类型而非哨兵对象区分“需要按最新归属重试”与“真正失败”；
/// - **契约 (What)**：
///   - `ResponseUnknown`：响应方在答复前离开或超时，且重试预算已耗尽；
///   - `Remote`：远端抛出的应用层失败；
///   - `Decode` / `Encode`：链式请求路由头的线格式错误；
///   - `ServiceStopped`：本地服务在请求进行中停止，投递未被保证；
///   - `PartitionsUnresolved`：协调器拒绝重新提交剩余分区；
///   - `InvalidConfig`：配置校验失败；
///   - `GateReentered`：在预处理闸门内的线程上关闭闸门，无法等待自身离开。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GridError {
    #[error("response unknown: the responder left or timed out before replying")]
    ResponseUnknown,

    #[error("remote failure: {0}")]
    Remote(RemoteFailure),

    #[error("malformed chained request routing: {reason}")]
    Decode { reason: String },

    #[error("cannot encode chained request routing: {reason}")]
    Encode { reason: String },

    #[error("service stopped before the request completed")]
    ServiceStopped,

    #[error("partitions {partitions} could not be resubmitted")]
    PartitionsUnresolved { partitions: PartitionSet },

    #[error("invalid grid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("thread gate closed from a thread that is still inside it")]
    GateReentered,
}

impl GridError {
    /// 是否应按当前归属重新提交。
    pub fn is_retryable(&self) -> bool {
        matches!(self, GridError::ResponseUnknown)
    }

    pub(crate) fn decode(reason: impl Into<String>) -> Self {
        GridError::Decode {
            reason: reason.into(),
        }
    }
}

impl From<RemoteFailure> for GridError {
    fn from(failure: RemoteFailure) -> Self {
        GridError::Remote(failure)
    }
}
