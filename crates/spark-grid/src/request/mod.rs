//! # 请求类型
//!
//! 四类请求共享同一套轮询机制，差异只在路由目标与轮询的完成判定：
//! - [`ChainedRequest`]：沿成员链逐跳转发，末跳向前驱答复；
//! - [`KeyRequest`]：按键路由到分区主拥有者的点对点请求；
//! - [`PartitionedRequest`]：按分区拆分到多个拥有者，逐分区汇聚部分响应；
//! - [`LeaseRequest`]：发往最老成员的租约请求。

mod chained;
mod key;
mod lease;
mod partitioned;

pub use chained::{ChainRoute, ChainedRequest};
pub use key::{KeyOperation, KeyRequest};
pub use lease::{LeaseAction, LeaseGrant, LeaseRequest};
pub use partitioned::{PartialResponse, PartitionedRequest, PartitionedResult};

pub(crate) use chained::{forward_or_reply, receive_chained};
pub(crate) use key::{receive_key, submit_key};
pub(crate) use lease::{receive_lease, submit_lease};
pub(crate) use partitioned::{PartitionedAggregate, receive_partitioned, submit_partitioned};
