//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 缓冲管理器只有两类失败：内存耗尽（调用方需降低需求）与编程错误（重复释放、释放外来缓冲）；
//! - 两类都不可重试，因此集中成一个 `thiserror` 枚举，由调用方按变体决定是否中止当前调用。
//!
//! ## 契约（What）
//! - 所有变体满足 `Send + Sync + 'static`，可跨线程传播；
//! - `UnknownBuffer` 表示调用代码存在缺陷，必须向上抛出而不是静默吞掉。

use thiserror::Error;

use crate::buffer::BufferId;

/// 缓冲管理领域的错误枚举。
///
/// # 教案式说明
/// - **意图 (Why)**：让 `acquire` 家族在无法满足需求时显式失败，而不是返回空值让调用方误以为可以重试；
/// - **契约 (What)**：
///   - `OutOfMemory`：底层分配器拒绝分配，`requested` 为本次请求的字节数；
///   - `UnknownBuffer`：释放或截断了未被追踪的缓冲（重复释放或来自其他管理器）；
///   - `InvalidConfig`：构造期的配置校验失败；
///   - `Disposed`：管理器已经调用过 `dispose`。
/// - **风险 (Trade-offs)**：`InvalidConfig` 使用 `String` 承载原因，仅在构造期出现，不影响热路径。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("unable to allocate a buffer of {requested} bytes: memory exhausted")]
    OutOfMemory { requested: usize },

    #[error("buffer {id} is not outstanding: double release or foreign buffer")]
    UnknownBuffer { id: BufferId },

    #[error("invalid buffer manager configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("buffer manager has been disposed")]
    Disposed,
}

impl BufferError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        BufferError::InvalidConfig {
            reason: reason.into(),
        }
    }
}
