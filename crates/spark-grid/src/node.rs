//! # GridNode：成员本地的协议调度器
//!
//! ## 核心意图（Why）
//! - 每个成员运行一个节点，持有本成员发起的全部轮询，并把入站消息分派给对应的请求类型；
//! - 轮询完成只由“成功从轮询表移除该轮询”的一方执行，即使响应、成员离开与超时在多个线程上同时到达。
//!
//! ## 逻辑解析（How）
//! - 响应直接交给轮询；轮询进入 `Completing` 后立即移除并关闭；
//! - 请求在并发模式下尝试非阻塞进入预处理闸门，成功则在接收线程上就地处理，否则按调度优先级排队，
//!   由 [`GridNode::run_pending`] 在工作线程上处理；
//! - 排队超过 `execution_timeout_millis` 的请求不再处理，直接以失败答复。
//!
//! ## 契约（What）
//! - 打开轮询先于投递消息，响应不可能先于轮询到达；
//! - 服务不处于运行状态时，入站请求被忽略。

use core::{
    cmp::Ordering as CmpOrdering,
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};
use std::{collections::BinaryHeap, sync::Arc};

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::{
    config::GridConfig,
    coordinator::{AsyncContext, PartitionOwnership, RequestCoordinator},
    error::RemoteFailure,
    gate::ThreadGate,
    handle::ResponseHandle,
    member::{MemberId, MemberSet},
    message::{Message, MessageBody, PollId, Request, RequestOptions, Response},
    poll::{Poll, PollState, RequestPoll},
    request::{
        ChainRoute, ChainedRequest, KeyRequest, LeaseGrant, LeaseRequest, PartitionedAggregate,
        PartitionedRequest, PartitionedResult, forward_or_reply, receive_chained, receive_key,
        receive_lease, receive_partitioned, submit_key, submit_lease, submit_partitioned,
    },
    service::{RequestHandler, ServiceContext, ServiceState},
};

/// 节点依赖的协作者。
pub struct GridCollaborators {
    pub context: Arc<dyn ServiceContext>,
    pub ownership: Arc<dyn PartitionOwnership>,
    pub coordinator: Arc<dyn RequestCoordinator>,
    pub handler: Arc<dyn RequestHandler>,
}

/// 排队等待工作线程处理的入站请求。
struct QueuedRequest {
    from: MemberId,
    poll_id: PollId,
    request: Request,
    priority: i32,
    sequence: u64,
    enqueued_at: u64,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    // 优先级高者先出；同优先级按到达顺序。
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// 成员本地的协议节点。
pub struct GridNode {
    member: MemberId,
    config: GridConfig,
    context: Arc<dyn ServiceContext>,
    ownership: Arc<dyn PartitionOwnership>,
    coordinator: Arc<dyn RequestCoordinator>,
    handler: Arc<dyn RequestHandler>,
    polls: DashMap<PollId, Poll>,
    next_poll: AtomicU64,
    next_sequence: AtomicU64,
    gate: ThreadGate,
    pending: Mutex<BinaryHeap<QueuedRequest>>,
}

impl GridNode {
    pub fn new(config: GridConfig, collaborators: GridCollaborators) -> Arc<Self> {
        let GridCollaborators {
            context,
            ownership,
            coordinator,
            handler,
        } = collaborators;
        let member = context.local_member();
        info!(%member, concurrent = config.concurrent, "grid node created");
        Arc::new(Self {
            member,
            config,
            context,
            ownership,
            coordinator,
            handler,
            polls: DashMap::new(),
            next_poll: AtomicU64::new(1),
            next_sequence: AtomicU64::new(0),
            gate: ThreadGate::new(),
            pending: Mutex::new(BinaryHeap::new()),
        })
    }

    pub fn member(&self) -> MemberId {
        self.member
    }

    pub fn config(&self) -> &GridConfig {
        &self.config
    }

    pub fn service_state(&self) -> ServiceState {
        self.context.service_state()
    }

    /// 本成员发起且尚未关闭的轮询数。
    pub fn open_polls(&self) -> usize {
        self.polls.len()
    }

    /// 排队等待处理的入站请求数。
    pub fn queued_requests(&self) -> usize {
        self.pending.lock().len()
    }

    // ---- 发起请求 ----

    /// 从本成员发起链式请求；`members` 为 `None` 时按环形顺序投递给全部成员。
    pub fn send_chained(
        &self,
        members: Option<Vec<MemberId>>,
        payload: Bytes,
        options: RequestOptions,
    ) -> Arc<ResponseHandle<()>> {
        let route = match members {
            Some(members) => ChainRoute::to_members(self.member, members),
            None => ChainRoute::to_all(self.member),
        };
        let handle = Arc::new(ResponseHandle::new());
        let mut request = ChainedRequest::new(route, payload).with_options(options);
        request.completion = Some(Arc::clone(&handle));
        forward_or_reply(self, request);
        handle
    }

    pub fn send_key(&self, request: KeyRequest) -> Arc<ResponseHandle<Option<Bytes>>> {
        let handle = Arc::new(ResponseHandle::new());
        submit_key(self, request, Arc::clone(&handle), 0);
        handle
    }

    /// 发起多分区请求。提供 `async_context` 时，完成与失败同时回调给它。
    pub fn send_partitioned(
        &self,
        mut request: PartitionedRequest,
        async_context: Option<Arc<dyn AsyncContext>>,
    ) -> Arc<ResponseHandle<PartitionedResult>> {
        let handle = Arc::new(ResponseHandle::new());
        let pending = async_context
            .as_ref()
            .and_then(|context| context.partition_set())
            .unwrap_or_else(|| request.partitions.clone());
        request.attempt = 0;
        request.origin = Some(Arc::new(PartitionedAggregate::new(
            Arc::clone(&handle),
            pending,
            async_context,
        )));
        self.submit_partitioned(request);
        handle
    }

    /// 按当前归属提交（或重新提交）多分区请求。
    pub fn submit_partitioned(&self, request: PartitionedRequest) {
        submit_partitioned(self, request);
    }

    pub fn send_lease(&self, request: LeaseRequest) -> Arc<ResponseHandle<LeaseGrant>> {
        let handle = Arc::new(ResponseHandle::new());
        submit_lease(self, request, Arc::clone(&handle), 0);
        handle
    }

    // ---- 入站 ----

    /// 传输层交付的消息入口。
    pub fn on_message(&self, message: Message) {
        let Message { from, to, body } = message;
        if to != self.member {
            warn!(member = %self.member, %to, "dropping message addressed to another member");
            return;
        }
        match body {
            MessageBody::Response { poll_id, response } => self.on_response(from, poll_id, response),
            MessageBody::Request { poll_id, request } => self.on_request(from, poll_id, request),
        }
    }

    fn on_response(&self, from: MemberId, poll_id: PollId, response: Response) {
        let state = match self.polls.get_mut(&poll_id) {
            Some(mut poll) => poll.on_response(from, response),
            None => {
                trace!(member = %self.member, poll = %poll_id, %from, "response for a closed poll");
                return;
            }
        };
        if state == PollState::Completing {
            self.finish(poll_id);
        }
    }

    fn on_request(&self, from: MemberId, poll_id: PollId, request: Request) {
        if !self.service_state().is_running() {
            debug!(member = %self.member, kind = request.kind(), "service not running, ignoring request");
            return;
        }
        if self.config.concurrent {
            if let Some(_guard) = self.gate.try_enter() {
                trace!(member = %self.member, kind = request.kind(), "processing request on the receiving thread");
                self.process(from, poll_id, request);
                return;
            }
        }
        let queued = QueuedRequest {
            from,
            poll_id,
            priority: request.options().scheduling_priority,
            request,
            sequence: self.next_sequence.fetch_add(1, Ordering::Relaxed),
            enqueued_at: self.context.now_millis(),
        };
        self.pending.lock().push(queued);
    }

    /// 处理排队的请求，返回处理（含超时拒绝）的请求数。
    pub fn run_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            let next = self.pending.lock().pop();
            let Some(queued) = next else {
                break;
            };
            if !self.service_state().is_running() {
                debug!(member = %self.member, "service not running, dropping queued request");
                continue;
            }
            let limit = queued.request.options().execution_timeout_millis;
            let waited = self.context.now_millis().saturating_sub(queued.enqueued_at);
            if limit > 0 && waited > limit {
                warn!(
                    member = %self.member,
                    kind = queued.request.kind(),
                    waited,
                    limit,
                    "request exceeded its execution timeout"
                );
                self.reply(
                    queued.from,
                    queued.poll_id,
                    Response::Failure(RemoteFailure::new(self.member, "execution timeout exceeded")),
                );
            } else {
                self.process(queued.from, queued.poll_id, queued.request);
            }
            handled += 1;
        }
        handled
    }

    fn process(&self, from: MemberId, poll_id: PollId, request: Request) {
        match request {
            Request::Chained(request) => receive_chained(self, from, poll_id, request),
            Request::Key(request) => receive_key(self, from, poll_id, request),
            Request::Partitioned(request) => {
                receive_partitioned(self, from, poll_id, request)
            }
            Request::Lease(request) => receive_lease(self, from, poll_id, request),
        }
    }

    // ---- 成员离开、超时与停止 ----

    /// 成员离开：从全部轮询的待答复成员中移除，随之完成的轮询立即关闭。
    pub fn on_member_left(&self, member: MemberId) {
        let completed: Vec<PollId> = self
            .polls
            .iter_mut()
            .filter_map(|mut entry| {
                (entry.value_mut().on_member_left(member) == PollState::Completing)
                    .then(|| *entry.key())
            })
            .collect();
        debug!(member = %self.member, departed = %member, completed = completed.len(), "member left");
        for poll_id in completed {
            self.finish(poll_id);
        }
    }

    /// 关闭截止时间不晚于 `now` 的轮询，返回关闭的数量。
    pub fn expire_polls(&self, now: u64) -> usize {
        let expired: Vec<PollId> = self
            .polls
            .iter_mut()
            .filter_map(|mut entry| {
                let due = entry.value().deadline().is_some_and(|deadline| deadline <= now);
                (due && entry.value_mut().on_timeout() == PollState::Completing)
                    .then(|| *entry.key())
            })
            .collect();
        let count = expired.len();
        for poll_id in expired {
            self.finish(poll_id);
        }
        count
    }

    /// 外部调度器报告单个轮询超时。
    pub fn on_poll_timeout(&self, poll_id: PollId) {
        let state = match self.polls.get_mut(&poll_id) {
            Some(mut poll) => poll.on_timeout(),
            None => return,
        };
        if state == PollState::Completing {
            self.finish(poll_id);
        }
    }

    /// 服务停止后调用：关闭闸门，丢弃排队请求，并关闭全部轮询。
    ///
    /// 调用时服务状态应已离开 `Running`，轮询的完成逻辑据此放弃而不是重试。
    pub fn shutdown(&self) {
        if let Err(err) = self.gate.close() {
            warn!(member = %self.member, error = %err, "shutdown requested from inside the preprocessing gate, not waiting for in-flight requests");
        }
        let dropped = {
            let mut pending = self.pending.lock();
            let dropped = pending.len();
            pending.clear();
            dropped
        };
        let open: Vec<PollId> = self.polls.iter().map(|entry| *entry.key()).collect();
        let abandoned = open.len();
        for poll_id in open {
            self.finish(poll_id);
        }
        info!(member = %self.member, dropped, abandoned, "grid node shut down");
    }

    // ---- 供请求类型使用 ----

    pub(crate) fn context(&self) -> &dyn ServiceContext {
        self.context.as_ref()
    }

    pub(crate) fn ownership(&self) -> &dyn PartitionOwnership {
        self.ownership.as_ref()
    }

    pub(crate) fn coordinator(&self) -> &dyn RequestCoordinator {
        self.coordinator.as_ref()
    }

    pub(crate) fn handler(&self) -> &dyn RequestHandler {
        self.handler.as_ref()
    }

    /// 打开轮询并登记到轮询表。目标全部不在成员视图中时轮询立即关闭，返回 `None`。
    pub(crate) fn open_poll(
        &self,
        targets: MemberSet,
        options: &RequestOptions,
        tracker: Box<dyn RequestPoll>,
    ) -> Option<PollId> {
        let poll_id = PollId::new(self.next_poll.fetch_add(1, Ordering::Relaxed));
        let view = self.context.service_members();
        let poll = Poll::new(poll_id, targets, &view, self.deadline_for(options), tracker);
        if poll.state() == PollState::Completing {
            trace!(member = %self.member, poll = %poll_id, "poll has no live targets, closing immediately");
            poll.close(self);
            return None;
        }
        self.polls.insert(poll_id, poll);
        if self.reconcile_departures(poll_id) {
            return None;
        }
        Some(poll_id)
    }

    /// 快照之后、登记之前离开的成员收不到 `on_member_left` 通知，登记后按最新视图补记为离开。
    ///
    /// 返回 `true` 表示轮询已经关闭（补记后完成，或已被其他线程关闭），调用方不得再投递消息。
    fn reconcile_departures(&self, poll_id: PollId) -> bool {
        let current = self.context.service_members();
        let completing = {
            let Some(mut poll) = self.polls.get_mut(&poll_id) else {
                return true;
            };
            let vanished: Vec<MemberId> = poll
                .remaining()
                .iter()
                .filter(|member| !current.contains(*member))
                .collect();
            let mut state = poll.state();
            for member in vanished {
                state = poll.on_member_left(member);
            }
            state == PollState::Completing
        };
        if completing {
            trace!(member = %self.member, poll = %poll_id, "targets left before poll registration, closing");
            self.finish(poll_id);
        }
        completing
    }

    pub(crate) fn post_request(&self, to: MemberId, poll_id: PollId, request: Request) {
        self.context
            .post(Message::request(self.member, to, poll_id, request));
    }

    pub(crate) fn reply(&self, to: MemberId, poll_id: PollId, response: Response) {
        self.context
            .post(Message::response(self.member, to, poll_id, response));
    }

    fn finish(&self, poll_id: PollId) {
        if let Some((_, poll)) = self.polls.remove(&poll_id) {
            poll.close(self);
        }
    }

    fn deadline_for(&self, options: &RequestOptions) -> Option<u64> {
        let timeout = match options.request_timeout_millis {
            0 => self.config.default_request_timeout_millis,
            timeout => timeout,
        };
        (timeout > 0).then(|| self.context.now_millis().saturating_add(timeout))
    }
}

impl fmt::Debug for GridNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GridNode")
            .field("member", &self.member)
            .field("config", &self.config)
            .field("open_polls", &self.polls.len())
            .finish_non_exhaustive()
    }
}
