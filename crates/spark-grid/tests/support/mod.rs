//! 集成测试共用的内存集群。
//!
//! # 教案式说明
//! - **意图 (Why)**：在单线程内确定性地重放成员之间的消息，精确控制“谁在何时离开”；
//! - **逻辑 (How)**：全部成员共享一个 FIFO 消息队列；投递给已离开成员的消息被丢弃；
//!   链式请求在投递时经过线格式编解码，与真实传输一样丢失发送方专用字段；
//! - **契约 (What)**：成员标识越小越老；分区按成员升序轮转分配，迁移时归属版本递增。
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use spark_grid::{
    ChainedRequest, GridCollaborators, GridConfig, GridNode, KeyRequest, LeaseAction, LeaseGrant,
    LeaseRequest, MemberId, MemberSet, Message, MessageBody, PartitionId, PartitionOwnership,
    PartitionSet, PartitionedRequest, RemoteFailure, Request, RequestHandler,
    RetryingCoordinator, ServiceContext, ServiceState,
};

pub fn m(raw: u32) -> MemberId {
    MemberId::new(raw)
}

pub fn partitions(count: u32, ids: &[u32]) -> PartitionSet {
    PartitionSet::from_partitions(count, ids.iter().copied().map(PartitionId::new))
}

/// 处理器记录的事件。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HandlerEvent {
    ChainReceived { member: MemberId, from: Option<MemberId> },
    ChainDelivered { member: MemberId },
    ChainCompleted { member: MemberId },
    Key { member: MemberId, key: Bytes },
    Partitioned { member: MemberId, owned: PartitionSet },
    Lease { member: MemberId, action: LeaseAction },
}

/// 可注入失败的处理器行为。
#[derive(Default)]
pub struct Behavior {
    pub failing_members: BTreeSet<MemberId>,
}

struct SimInner {
    members: Mutex<BTreeSet<MemberId>>,
    stopped: Mutex<BTreeSet<MemberId>>,
    queue: Mutex<VecDeque<Message>>,
    now: AtomicU64,
    owners: Mutex<Vec<Option<MemberId>>>,
    versions: Mutex<Vec<u64>>,
    events: Mutex<Vec<HandlerEvent>>,
    behavior: Mutex<Behavior>,
    leases: Mutex<BTreeMap<Bytes, MemberId>>,
}

struct SimContext {
    member: MemberId,
    inner: Arc<SimInner>,
}

impl ServiceContext for SimContext {
    fn local_member(&self) -> MemberId {
        self.member
    }

    fn service_state(&self) -> ServiceState {
        if self.inner.stopped.lock().contains(&self.member) {
            ServiceState::Stopped
        } else {
            ServiceState::Running
        }
    }

    fn service_members(&self) -> MemberSet {
        self.inner.members.lock().iter().copied().collect()
    }

    fn post(&self, message: Message) {
        self.inner.queue.lock().push_back(message);
    }

    fn now_millis(&self) -> u64 {
        self.inner.now.load(Ordering::SeqCst)
    }
}

struct SimOwnership {
    inner: Arc<SimInner>,
}

impl PartitionOwnership for SimOwnership {
    fn partition_count(&self) -> u32 {
        self.inner.owners.lock().len() as u32
    }

    fn owner_of(&self, partition: PartitionId) -> Option<MemberId> {
        self.inner
            .owners
            .lock()
            .get(partition.get() as usize)
            .copied()
            .flatten()
    }

    fn ownership_version(&self, partition: PartitionId) -> u64 {
        self.inner
            .versions
            .lock()
            .get(partition.get() as usize)
            .copied()
            .unwrap_or(0)
    }
}

struct RecordingHandler {
    member: MemberId,
    inner: Arc<SimInner>,
}

impl RecordingHandler {
    fn record(&self, event: HandlerEvent) {
        self.inner.events.lock().push(event);
    }

    fn check_failure(&self) -> Result<(), RemoteFailure> {
        if self.inner.behavior.lock().failing_members.contains(&self.member) {
            Err(RemoteFailure::new(self.member, "injected failure"))
        } else {
            Ok(())
        }
    }
}

impl RequestHandler for RecordingHandler {
    fn on_key_request(&self, request: &KeyRequest) -> Result<Option<Bytes>, RemoteFailure> {
        self.record(HandlerEvent::Key {
            member: self.member,
            key: request.key.clone(),
        });
        self.check_failure()?;
        Ok(Some(key_value(self.member, &request.key)))
    }

    fn on_partitioned_request(
        &self,
        _request: &PartitionedRequest,
        owned: &PartitionSet,
    ) -> Result<Vec<(PartitionId, Bytes)>, RemoteFailure> {
        self.record(HandlerEvent::Partitioned {
            member: self.member,
            owned: owned.clone(),
        });
        self.check_failure()?;
        Ok(owned
            .iter()
            .map(|partition| (partition, partition_value(self.member, partition)))
            .collect())
    }

    fn on_lease_request(&self, request: &LeaseRequest) -> Result<LeaseGrant, RemoteFailure> {
        self.record(HandlerEvent::Lease {
            member: self.member,
            action: request.action,
        });
        self.check_failure()?;
        let mut leases = self.inner.leases.lock();
        let (granted, holder) = match request.action {
            LeaseAction::Lock { holder } => {
                let current = *leases.entry(request.key.clone()).or_insert(holder);
                (current == holder, current)
            }
            LeaseAction::Unlock { holder } => {
                if leases.get(&request.key) == Some(&holder) {
                    leases.remove(&request.key);
                    (true, holder)
                } else {
                    (false, holder)
                }
            }
        };
        Ok(LeaseGrant {
            key: request.key.clone(),
            holder,
            granted,
        })
    }

    fn on_chain_received(&self, member: MemberId, request: &ChainedRequest) {
        self.record(HandlerEvent::ChainReceived {
            member,
            from: request.predecessor(),
        });
    }

    fn on_chain_delivered(&self, member: MemberId, _request: &ChainedRequest) {
        self.record(HandlerEvent::ChainDelivered { member });
    }

    fn on_chain_completed(&self, member: MemberId, _request: &ChainedRequest) {
        self.record(HandlerEvent::ChainCompleted { member });
    }
}

pub fn key_value(member: MemberId, key: &[u8]) -> Bytes {
    Bytes::from(format!("{}:{}", member.get(), String::from_utf8_lossy(key)))
}

pub fn partition_value(member: MemberId, partition: PartitionId) -> Bytes {
    Bytes::from(format!("{}:{}", member.get(), partition.get()))
}

/// 内存集群。
pub struct SimCluster {
    inner: Arc<SimInner>,
    nodes: BTreeMap<MemberId, Arc<GridNode>>,
    coordinators: BTreeMap<MemberId, Arc<RetryingCoordinator>>,
    ownership: SimOwnership,
}

impl SimCluster {
    pub fn new(members: &[u32], partition_count: u32) -> Self {
        Self::with_config(members, partition_count, GridConfig::default(), 4)
    }

    pub fn with_config(
        members: &[u32],
        partition_count: u32,
        config: GridConfig,
        max_resubmits: u32,
    ) -> Self {
        let ids: Vec<MemberId> = members.iter().copied().map(MemberId::new).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        let owners = (0..partition_count as usize)
            .map(|partition| sorted.get(partition % sorted.len().max(1)).copied())
            .collect();
        let inner = Arc::new(SimInner {
            members: Mutex::new(ids.iter().copied().collect()),
            stopped: Mutex::new(BTreeSet::new()),
            queue: Mutex::new(VecDeque::new()),
            now: AtomicU64::new(0),
            owners: Mutex::new(owners),
            versions: Mutex::new(vec![1; partition_count as usize]),
            events: Mutex::new(Vec::new()),
            behavior: Mutex::new(Behavior::default()),
            leases: Mutex::new(BTreeMap::new()),
        });

        let mut nodes = BTreeMap::new();
        let mut coordinators = BTreeMap::new();
        for member in ids {
            let coordinator = Arc::new(RetryingCoordinator::new(max_resubmits));
            let node = GridNode::new(
                config.clone(),
                GridCollaborators {
                    context: Arc::new(SimContext {
                        member,
                        inner: Arc::clone(&inner),
                    }),
                    ownership: Arc::new(SimOwnership {
                        inner: Arc::clone(&inner),
                    }),
                    coordinator: coordinator.clone(),
                    handler: Arc::new(RecordingHandler {
                        member,
                        inner: Arc::clone(&inner),
                    }),
                },
            );
            coordinator.bind(&node);
            nodes.insert(member, node);
            coordinators.insert(member, coordinator);
        }
        let ownership = SimOwnership {
            inner: Arc::clone(&inner),
        };
        Self {
            inner,
            nodes,
            coordinators,
            ownership,
        }
    }

    pub fn node(&self, raw: u32) -> &Arc<GridNode> {
        &self.nodes[&m(raw)]
    }

    pub fn coordinator(&self, raw: u32) -> &Arc<RetryingCoordinator> {
        &self.coordinators[&m(raw)]
    }

    pub fn events(&self) -> Vec<HandlerEvent> {
        self.inner.events.lock().clone()
    }

    pub fn fail_on(&self, raw: u32) {
        self.inner.behavior.lock().failing_members.insert(m(raw));
    }

    pub fn now(&self) -> u64 {
        self.inner.now.load(Ordering::SeqCst)
    }

    pub fn advance_clock(&self, millis: u64) -> u64 {
        self.inner.now.fetch_add(millis, Ordering::SeqCst) + millis
    }

    pub fn queued_messages(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// 下一条待投递消息的目标成员。
    pub fn peek_destination(&self) -> Option<MemberId> {
        self.inner.queue.lock().front().map(|message| message.to)
    }

    pub fn owner_of(&self, partition: u32) -> Option<MemberId> {
        self.ownership.owner_of(PartitionId::new(partition))
    }

    pub fn owner_of_key(&self, key: &[u8]) -> Option<MemberId> {
        self.ownership
            .owner_of(self.ownership.partition_of_key(key))
    }

    pub fn partition_of_key(&self, key: &[u8]) -> u32 {
        self.ownership.partition_of_key(key).get()
    }

    /// 找到一个当前由 `raw` 拥有的键，跳过 `skip` 个候选。
    pub fn key_owned_by(&self, raw: u32, skip: usize) -> Bytes {
        (0..10_000)
            .map(|index| Bytes::from(format!("key-{index}")))
            .filter(|key| self.owner_of_key(key) == Some(m(raw)))
            .nth(skip)
            .expect("分区数有限，总能找到目标成员拥有的键")
    }

    /// 把分区迁移给 `owner`（`None` 表示无主），归属版本递增。
    pub fn move_partition(&self, partition: u32, owner: Option<u32>) {
        self.inner.owners.lock()[partition as usize] = owner.map(m);
        self.inner.versions.lock()[partition as usize] += 1;
    }

    /// 投递队首消息；目标已离开时丢弃。返回是否取出了消息。
    pub fn step(&self) -> bool {
        let next = self.inner.queue.lock().pop_front();
        match next {
            Some(message) => {
                self.deliver(message);
                true
            }
            None => false,
        }
    }

    /// 丢弃队首消息，模拟传输丢包。
    pub fn drop_next(&self) -> bool {
        self.inner.queue.lock().pop_front().is_some()
    }

    /// 投递队列中第一条发往 `raw` 的消息。
    pub fn deliver_first_to(&self, raw: u32) -> bool {
        let next = {
            let mut queue = self.inner.queue.lock();
            queue
                .iter()
                .position(|message| message.to == m(raw))
                .and_then(|index| queue.remove(index))
        };
        match next {
            Some(message) => {
                self.deliver(message);
                true
            }
            None => false,
        }
    }

    /// 交替投递消息与处理排队请求，直到集群静止。
    pub fn run_until_quiet(&self) {
        for _ in 0..10_000 {
            let mut progressed = false;
            while self.step() {
                progressed = true;
            }
            for (member, node) in &self.nodes {
                if self.is_live(*member) && node.run_pending() > 0 {
                    progressed = true;
                }
            }
            if !progressed {
                return;
            }
        }
        panic!("集群在 10000 轮内没有静止");
    }

    /// 成员离开：其分区按轮转迁移给剩余成员，其余节点收到离开通知。
    pub fn remove_member(&self, raw: u32) {
        let departed = m(raw);
        self.inner.members.lock().remove(&departed);
        let remaining: Vec<MemberId> = self.inner.members.lock().iter().copied().collect();
        {
            let mut owners = self.inner.owners.lock();
            let mut versions = self.inner.versions.lock();
            for (index, owner) in owners.iter_mut().enumerate() {
                if *owner == Some(departed) {
                    *owner = remaining.get(index % remaining.len().max(1)).copied();
                    versions[index] += 1;
                }
            }
        }
        for member in remaining {
            self.nodes[&member].on_member_left(departed);
        }
    }

    /// 停止成员上的服务并关闭其节点。
    pub fn stop_member(&self, raw: u32) {
        self.inner.stopped.lock().insert(m(raw));
        self.nodes[&m(raw)].shutdown();
    }

    fn is_live(&self, member: MemberId) -> bool {
        self.inner.members.lock().contains(&member)
    }

    fn deliver(&self, message: Message) {
        if !self.is_live(message.to) {
            return;
        }
        let message = match message.body {
            MessageBody::Request {
                poll_id,
                request: Request::Chained(request),
            } => {
                let view: MemberSet = self.inner.members.lock().iter().copied().collect();
                let mut wire = BytesMut::new();
                request.encode(&mut wire).expect("测试路由必须可编码");
                let decoded =
                    ChainedRequest::decode(&mut wire.freeze(), &view).expect("编码结果必须可解码");
                Message::request(message.from, message.to, poll_id, Request::Chained(decoded))
            }
            body => Message { body, ..message },
        };
        self.nodes[&message.to].on_message(message);
    }
}
