#![doc = r#"
# spark-grid

## 设计目标（Why）
- 为分区数据网格提供成员之间的请求/响应协议：链式转发、按键点对点、按分区多播与租约签发；
- 成员在请求进行中离开时，按最新成员视图与分区归属透明重试，调用方只看到确定的结果、原样的应用层失败，
  或重试预算耗尽后的 [`GridError::ResponseUnknown`]。

## 核心契约（What）
- [`GridNode`] 是每个成员的协议入口，持有本成员发起的全部 [`Poll`]；
- 传输、成员视图、分区归属、重新提交与业务处理均通过 trait 注入：
  [`ServiceContext`]、[`PartitionOwnership`]、[`RequestCoordinator`]、[`RequestHandler`]；
- 每个轮询的完成逻辑只执行一次；服务停止期间关闭的轮询不报告完成。

## 实现策略（How）
- 轮询表使用 `dashmap`，完成由成功移除轮询的一方执行；
- 入站请求在并发模式下通过 [`ThreadGate`] 尝试就地处理，否则按调度优先级排队；
- 链式请求的路由头使用 `bytes` 编解码，解码对成员变更保持宽容。

## 风险与注意（Trade-offs）
- `ServiceContext::post` 必须异步投递；同步投递会让响应在轮询登记前到达调用栈。
"#]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod gate;
pub mod handle;
pub mod member;
pub mod message;
pub mod node;
pub mod partition;
pub mod poll;
pub mod request;
pub mod service;

pub use config::GridConfig;
pub use coordinator::{
    AsyncContext, CoordinatorEvent, PartitionOwnership, RequestCoordinator, RetryingCoordinator,
};
pub use error::{GridError, RemoteFailure};
pub use gate::{GateGuard, ThreadGate};
pub use handle::ResponseHandle;
pub use member::{MemberId, MemberSet};
pub use message::{Message, MessageBody, PollId, Request, RequestOptions, Response};
pub use node::{GridCollaborators, GridNode};
pub use partition::{PartitionId, PartitionSet};
pub use poll::{Disposition, Poll, PollClosure, PollState, RequestPoll};
pub use request::{
    ChainRoute, ChainedRequest, KeyOperation, KeyRequest, LeaseAction, LeaseGrant, LeaseRequest,
    PartialResponse, PartitionedRequest, PartitionedResult,
};
pub use service::{RequestHandler, ServiceContext, ServiceState};
