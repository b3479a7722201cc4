//! # 多分区请求
//!
//! ## 核心意图（Why）
//! - 一次请求覆盖多个分区，按当前归属拆分给各拥有者；每个拥有者只答复自己拥有的分区，并显式拒绝其余分区；
//! - 轮询用“答复掩码”逐分区记账，直到每个请求的分区都有确定答复或拒绝记录，或者任一部分响应携带失败。
//!
//! ## 逻辑解析（How）
//! - 发送方在提交时按分区填写归属版本，接收方只处理归属版本仍然匹配的分区；
//! - 轮询关闭后：已答复分区并入汇总结果，掩码中残留的分区（拥有者离开或无主）与被拒绝分区交给协调器重新提交；
//! - 协调器的 `finalize_response` 始终在 `resubmit_request` 之后调用。
//!
//! ## 契约（What）
//! - 调用方的响应句柄在所关注分区全部答复后完成一次；
//! - 任一部分响应为失败时立即关闭轮询，失败原样交给调用方，不再重新提交。

use core::fmt;
use std::{collections::BTreeMap, mem, sync::Arc};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::{
    coordinator::AsyncContext,
    error::{GridError, RemoteFailure},
    handle::ResponseHandle,
    member::{MemberId, MemberSet},
    message::{PollId, Request, RequestOptions, Response},
    node::GridNode,
    partition::{PartitionId, PartitionSet},
    poll::{Disposition, PollClosure, RequestPoll},
};

/// 覆盖一组分区的请求。
#[derive(Clone)]
pub struct PartitionedRequest {
    pub service_id: u32,
    pub cache_id: u64,
    pub partitions: PartitionSet,
    /// 调用方维护的顺序标识，重新提交时保持不变。
    pub order_id: u64,
    /// 发送时各分区的归属版本。
    pub ownership_versions: BTreeMap<PartitionId, u64>,
    pub payload: Bytes,
    pub options: RequestOptions,
    /// 重新提交次数，首次发送为 0。
    pub attempt: u32,
    pub(crate) origin: Option<Arc<PartitionedAggregate>>,
}

impl PartitionedRequest {
    pub fn new(cache_id: u64, partitions: PartitionSet, payload: Bytes) -> Self {
        Self {
            service_id: 0,
            cache_id,
            partitions,
            order_id: 0,
            ownership_versions: BTreeMap::new(),
            payload,
            options: RequestOptions::default(),
            attempt: 0,
            origin: None,
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_order_id(mut self, order_id: u64) -> Self {
        self.order_id = order_id;
        self
    }

    /// 不含发送方汇总状态的副本。
    pub(crate) fn detached(&self) -> Self {
        Self {
            origin: None,
            ..self.clone()
        }
    }
}

impl fmt::Debug for PartitionedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionedRequest")
            .field("service_id", &self.service_id)
            .field("cache_id", &self.cache_id)
            .field("partitions", &self.partitions)
            .field("order_id", &self.order_id)
            .field("attempt", &self.attempt)
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// 拥有者的部分响应。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartialResponse {
    /// 已确定答复的分区。
    pub answered: PartitionSet,
    /// 拒绝处理的分区（不再拥有或归属版本已变化）。
    pub rejected: PartitionSet,
    pub results: Vec<(PartitionId, Bytes)>,
}

/// 汇总后的结果，按分区升序排列。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionedResult {
    pub entries: Vec<(PartitionId, Bytes)>,
}

/// 发送方跨多次重新提交共享的汇总状态。
pub(crate) struct PartitionedAggregate {
    handle: Arc<ResponseHandle<PartitionedResult>>,
    async_context: Option<Arc<dyn AsyncContext>>,
    state: Mutex<AggregateState>,
}

struct AggregateState {
    pending: PartitionSet,
    results: BTreeMap<PartitionId, Bytes>,
    done: bool,
}

impl PartitionedAggregate {
    pub(crate) fn new(
        handle: Arc<ResponseHandle<PartitionedResult>>,
        pending: PartitionSet,
        async_context: Option<Arc<dyn AsyncContext>>,
    ) -> Self {
        Self {
            handle,
            async_context,
            state: Mutex::new(AggregateState {
                pending,
                results: BTreeMap::new(),
                done: false,
            }),
        }
    }

    /// 并入已答复的分区；所关注分区全部答复时完成句柄。
    fn absorb(&self, processed: &PartitionSet, results: Vec<(PartitionId, Bytes)>) {
        let finished = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            state.results.extend(results);
            state.pending.remove_all(processed);
            if state.pending.is_empty() {
                state.done = true;
                Some(PartitionedResult {
                    entries: mem::take(&mut state.results).into_iter().collect(),
                })
            } else {
                None
            }
        };
        if let Some(result) = finished {
            self.handle.complete(Ok(result));
            if let Some(context) = &self.async_context {
                context.process_completion();
            }
        }
    }

    fn fail(&self, error: GridError) {
        if !self.mark_done() {
            return;
        }
        if let Some(context) = &self.async_context {
            context.process_exception(&error);
        }
        self.handle.complete(Err(error));
    }

    /// 服务停止：解除同步等待者，不触发异步回调。
    fn abandon(&self) {
        if self.mark_done() {
            self.handle.complete(Err(GridError::ServiceStopped));
        }
    }

    fn mark_done(&self) -> bool {
        let mut state = self.state.lock();
        !mem::replace(&mut state.done, true)
    }
}

/// 按当前归属拆分并发送。无主分区留在答复掩码中，轮询关闭后交给协调器重新提交。
pub(crate) fn submit_partitioned(node: &GridNode, mut request: PartitionedRequest) {
    let ownership = node.ownership();
    let count = request.partitions.partition_count();
    let mut by_owner: BTreeMap<MemberId, PartitionSet> = BTreeMap::new();
    request.ownership_versions.clear();
    for partition in request.partitions.iter() {
        request
            .ownership_versions
            .insert(partition, ownership.ownership_version(partition));
        if let Some(owner) = ownership.owner_of(partition) {
            by_owner
                .entry(owner)
                .or_insert_with(|| PartitionSet::new(count))
                .add(partition);
        }
    }

    let targets: MemberSet = by_owner.keys().copied().collect();
    let messages: Vec<(MemberId, PartitionedRequest)> = by_owner
        .into_iter()
        .map(|(owner, subset)| {
            let mut message = request.detached();
            message
                .ownership_versions
                .retain(|partition, _| subset.contains(*partition));
            message.partitions = subset;
            (owner, message)
        })
        .collect();
    let options = request.options;
    let tracker = Box::new(PartitionedPoll {
        mask: request.partitions.clone(),
        processed: PartitionSet::new(count),
        rejected: PartitionSet::new(count),
        results: Vec::new(),
        failure: None,
        request,
    });
    if let Some(poll_id) = node.open_poll(targets, &options, tracker) {
        for (owner, message) in messages {
            trace!(member = %node.member(), %owner, partitions = %message.partitions, poll = %poll_id, "sending partitioned request");
            node.post_request(owner, poll_id, Request::Partitioned(message));
        }
    }
}

/// 拥有者答复自己拥有且归属版本匹配的分区，拒绝其余分区。
pub(crate) fn receive_partitioned(
    node: &GridNode,
    from: MemberId,
    poll_id: PollId,
    request: PartitionedRequest,
) {
    let member = node.member();
    let ownership = node.ownership();
    let count = request.partitions.partition_count();
    let mut owned = PartitionSet::new(count);
    let mut rejected = PartitionSet::new(count);
    for partition in request.partitions.iter() {
        let current = request
            .ownership_versions
            .get(&partition)
            .is_none_or(|version| *version == ownership.ownership_version(partition));
        if current && ownership.owner_of(partition) == Some(member) {
            owned.add(partition);
        } else {
            rejected.add(partition);
        }
    }

    let response = if owned.is_empty() {
        Response::Partial(PartialResponse {
            answered: owned,
            rejected,
            results: Vec::new(),
        })
    } else {
        match node.handler().on_partitioned_request(&request, &owned) {
            Ok(results) => Response::Partial(PartialResponse {
                results: results
                    .into_iter()
                    .filter(|(partition, _)| owned.contains(*partition))
                    .collect(),
                answered: owned,
                rejected,
            }),
            Err(failure) => Response::Failure(failure),
        }
    };
    node.reply(from, poll_id, response);
}

struct PartitionedPoll {
    request: PartitionedRequest,
    /// 尚未得到答复或拒绝的分区。
    mask: PartitionSet,
    processed: PartitionSet,
    rejected: PartitionSet,
    results: Vec<(PartitionId, Bytes)>,
    failure: Option<RemoteFailure>,
}

impl RequestPoll for PartitionedPoll {
    fn on_response(&mut self, from: MemberId, response: Response) -> Disposition {
        match response {
            Response::Partial(partial) => {
                self.mask.remove_all(&partial.answered);
                self.mask.remove_all(&partial.rejected);
                self.processed.add_all(&partial.answered);
                self.rejected.add_all(&partial.rejected);
                self.results.extend(partial.results);
                if self.mask.is_empty() {
                    Disposition::CloseNow
                } else {
                    Disposition::MemberDone
                }
            }
            Response::Failure(failure) => {
                self.failure = Some(failure);
                Disposition::CloseNow
            }
            other => {
                trace!(%from, response = ?other, "partitioned poll ignoring non-partial response");
                Disposition::MemberDone
            }
        }
    }

    fn on_completion(self: Box<Self>, node: &GridNode, closure: PollClosure) {
        let PartitionedPoll {
            request,
            mask,
            processed,
            rejected,
            results,
            failure,
        } = *self;
        let coordinator = node.coordinator();

        if let Some(failure) = failure {
            debug!(member = %node.member(), poll = %closure.poll_id, %failure, "partitioned request failed");
            if let Some(aggregate) = &request.origin {
                aggregate.fail(GridError::Remote(failure));
            }
            coordinator.finalize_response(&request.partitions);
            return;
        }
        if !closure.service_state.is_running() {
            debug!(member = %node.member(), poll = %closure.poll_id, "service stopped, abandoning partitioned request");
            if let Some(aggregate) = &request.origin {
                aggregate.abandon();
            }
            return;
        }

        if let Some(aggregate) = &request.origin {
            aggregate.absorb(&processed, results);
        }
        let resubmit = mask.union(&rejected);
        if !resubmit.is_empty() {
            let mut retry_request = request.clone();
            retry_request.partitions = resubmit.clone();
            retry_request.attempt += 1;
            debug!(
                member = %node.member(),
                retry = %mask,
                %rejected,
                attempt = retry_request.attempt,
                "resubmitting unresolved partitions"
            );
            if !coordinator.resubmit_request(retry_request, &mask, &rejected) {
                warn!(member = %node.member(), partitions = %resubmit, "coordinator refused to resubmit partitions");
                if let Some(aggregate) = &request.origin {
                    aggregate.fail(GridError::PartitionsUnresolved {
                        partitions: resubmit,
                    });
                }
            }
        }
        // 先给重新提交认领分区的机会，再完成本轮记账。
        coordinator.finalize_response(&request.partitions);
    }

    fn describe(&self) -> &'static str {
        "partitioned"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct CountingContext {
        completions: AtomicUsize,
        exceptions: AtomicUsize,
    }

    impl AsyncContext for CountingContext {
        fn process_completion(&self) {
            self.completions.fetch_add(1, Ordering::SeqCst);
        }

        fn process_exception(&self, _error: &GridError) {
            self.exceptions.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn set(ids: &[u32]) -> PartitionSet {
        PartitionSet::from_partitions(8, ids.iter().copied().map(PartitionId::new))
    }

    #[test]
    fn aggregate_completes_once_all_pending_partitions_answer() {
        let handle = Arc::new(ResponseHandle::new());
        let context = Arc::new(CountingContext::default());
        let aggregate = PartitionedAggregate::new(
            Arc::clone(&handle),
            set(&[1, 3]),
            Some(Arc::clone(&context) as Arc<dyn AsyncContext>),
        );

        aggregate.absorb(&set(&[3]), vec![(PartitionId::new(3), Bytes::from_static(b"c"))]);
        assert!(!handle.is_done());
        aggregate.absorb(&set(&[1]), vec![(PartitionId::new(1), Bytes::from_static(b"a"))]);
        aggregate.fail(GridError::ResponseUnknown);

        let result = handle.check_response().expect("全部分区已答复");
        assert_eq!(
            result.entries,
            vec![
                (PartitionId::new(1), Bytes::from_static(b"a")),
                (PartitionId::new(3), Bytes::from_static(b"c")),
            ]
        );
        assert_eq!(context.completions.load(Ordering::SeqCst), 1);
        assert_eq!(context.exceptions.load(Ordering::SeqCst), 0, "完成后的失败被忽略");
    }

    #[test]
    fn poll_mask_clears_per_partial_and_failure_short_circuits() {
        let mut poll = PartitionedPoll {
            request: PartitionedRequest::new(1, set(&[0, 1, 2]), Bytes::new()),
            mask: set(&[0, 1, 2]),
            processed: set(&[]),
            rejected: set(&[]),
            results: Vec::new(),
            failure: None,
        };
        let partial = Response::Partial(PartialResponse {
            answered: set(&[0]),
            rejected: set(&[1]),
            results: Vec::new(),
        });
        assert_eq!(poll.on_response(MemberId::new(2), partial), Disposition::MemberDone);
        assert_eq!(poll.mask, set(&[2]));

        let failure = Response::Failure(RemoteFailure::new(MemberId::new(3), "boom"));
        assert_eq!(poll.on_response(MemberId::new(3), failure), Disposition::CloseNow);
    }
}
