//! # 分区协作者契约
//!
//! ## 角色定位（Why）
//! - [`PartitionOwnership`] 提供分区归属与归属版本，键请求与多分区请求据此路由；
//! - [`RequestCoordinator`] 负责把被拒绝或未答复的分区按最新归属重新提交；
//! - [`AsyncContext`] 是异步调用方的完成回调。
//!
//! ## 顺序约束（What）
//! - 轮询完成时必须先调用 `resubmit_request`，再调用 `finalize_response`；
//!   否则并发进行中的重新提交可能在认领分区之前就被记账为“已完成”。

use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    error::GridError,
    member::MemberId,
    node::GridNode,
    partition::{PartitionId, PartitionSet},
    request::PartitionedRequest,
};

/// 分区归属视图。
pub trait PartitionOwnership: Send + Sync {
    fn partition_count(&self) -> u32;

    /// 分区的当前主拥有者；分区处于无主状态时返回 `None`。
    fn owner_of(&self, partition: PartitionId) -> Option<MemberId>;

    /// 分区归属版本，每次迁移后递增。
    fn ownership_version(&self, partition: PartitionId) -> u64;

    /// 键所属的分区。
    fn partition_of_key(&self, key: &[u8]) -> PartitionId {
        let count = self.partition_count().max(1);
        // FNV-1a
        let hash = key.iter().fold(0xcbf2_9ce4_8422_2325u64, |hash, byte| {
            (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
        });
        PartitionId::new((hash % u64::from(count)) as u32)
    }
}

/// 多分区请求的重新提交协作者。
///
/// # 契约定义（What）
/// - `resubmit_request`：`request` 是原请求的克隆，分区已替换为 `partitions_to_retry ∪ rejected`；
///   返回 `true` 表示重新提交已被安排；
/// - `finalize_response`：标记 `partitions` 对应的记账完成，只能在重新提交尝试之后调用。
pub trait RequestCoordinator: Send + Sync {
    fn resubmit_request(
        &self,
        request: PartitionedRequest,
        partitions_to_retry: &PartitionSet,
        rejected: &PartitionSet,
    ) -> bool;

    fn finalize_response(&self, partitions: &PartitionSet);
}

/// 异步调用方的完成回调。
///
/// `partition_set` 返回调用方关心的分区；提供时，只有这些分区全部得到答复，请求才算完成。
pub trait AsyncContext: Send + Sync {
    fn process_completion(&self);

    fn process_exception(&self, error: &GridError);

    fn partition_set(&self) -> Option<PartitionSet> {
        None
    }
}

/// 协调器记录的事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoordinatorEvent {
    Resubmitted {
        retry: PartitionSet,
        rejected: PartitionSet,
        attempt: u32,
    },
    Refused {
        partitions: PartitionSet,
        attempt: u32,
    },
    Finalized {
        partitions: PartitionSet,
    },
}

/// 通过本地节点重新提交的默认协调器。
///
/// # 教案式说明
/// - **意图 (Why)**：大多数部署只需要“按最新归属立即重发，超过次数即放弃”的策略；
/// - **逻辑 (How)**：节点构造完成后调用 [`bind`](Self::bind) 注入弱引用，避免节点与协调器互相持有；
/// - **契约 (What)**：请求的 `attempt` 超过 `max_attempts` 时拒绝重新提交；
///   全部事件按发生顺序记录，可通过 [`events`](Self::events) 读取。
#[derive(Debug)]
pub struct RetryingCoordinator {
    node: OnceLock<Weak<GridNode>>,
    max_attempts: u32,
    events: Mutex<Vec<CoordinatorEvent>>,
}

impl RetryingCoordinator {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            node: OnceLock::new(),
            max_attempts,
            events: Mutex::new(Vec::new()),
        }
    }

    /// 绑定执行重新提交的节点；重复绑定被忽略。
    pub fn bind(&self, node: &Arc<GridNode>) {
        let _ = self.node.set(Arc::downgrade(node));
    }

    pub fn events(&self) -> Vec<CoordinatorEvent> {
        self.events.lock().clone()
    }
}

impl RequestCoordinator for RetryingCoordinator {
    fn resubmit_request(
        &self,
        request: PartitionedRequest,
        partitions_to_retry: &PartitionSet,
        rejected: &PartitionSet,
    ) -> bool {
        let attempt = request.attempt;
        let node = self.node.get().and_then(Weak::upgrade);
        let Some(node) = node.filter(|_| attempt <= self.max_attempts) else {
            self.events.lock().push(CoordinatorEvent::Refused {
                partitions: request.partitions.clone(),
                attempt,
            });
            return false;
        };
        self.events.lock().push(CoordinatorEvent::Resubmitted {
            retry: partitions_to_retry.clone(),
            rejected: rejected.clone(),
            attempt,
        });
        debug!(
            member = %node.member(),
            attempt,
            partitions = %request.partitions,
            "resubmitting partitioned request"
        );
        node.submit_partitioned(request);
        true
    }

    fn finalize_response(&self, partitions: &PartitionSet) {
        self.events.lock().push(CoordinatorEvent::Finalized {
            partitions: partitions.clone(),
        });
    }
}
