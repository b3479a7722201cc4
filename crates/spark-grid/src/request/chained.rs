//! # 链式请求
//!
//! ## 核心意图（Why）
//! - 把一条消息按顺序送过 `S → M1 → M2 → …`，每一跳要么转发给下一跳，要么作为末跳向前驱答复；
//! - 中间某跳在答复前离开时，由它的前驱重新选择下一跳，发起者最终仍只收到一次完成通知。
//!
//! ## 逻辑解析（How）
//! - 每一跳在转发时为下一跳打开一个单目标轮询，轮询追踪器保留本跳的剩余路由与前驱回指；
//! - 下一跳答复 `Ack` 后，本跳再向自己的前驱答复，答复沿链路逆向传回发起者；
//! - 轮询在无结果的情况下关闭（下一跳离开或超时）且服务仍在运行时，以剩余路由再次执行“转发或答复”。
//!
//! ## 线格式（What）
//! - 路由头：`[i32 发起者][i16 成员数][成员数 × i32 成员]`，成员数为 `-1` 表示“全部成员”；
//! - 解码时丢弃不在接收方成员视图中的成员，成员变更期间的报文因此仍可被接受；
//! - 前驱回指与响应句柄只存在于发送方，投递前被剥离。

use core::fmt;
use std::{collections::VecDeque, sync::Arc};

use bytes::{Buf, BufMut, Bytes};
use tracing::debug;

use crate::{
    error::{GridError, RemoteFailure},
    handle::ResponseHandle,
    member::{MemberId, MemberSet},
    message::{PollId, Request, RequestOptions, Response},
    node::GridNode,
    poll::{Disposition, PollClosure, RequestPoll},
};

/// 路由头中“全部成员”的成员数编码。
const ALL_MEMBERS: i16 = -1;

/// 前驱回指：本跳收到的请求来自哪个成员的哪个轮询。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Incoming {
    pub(crate) from: MemberId,
    pub(crate) poll_id: PollId,
}

/// 链式请求的路由。
///
/// `members` 为 `None` 表示按环形顺序投递给全部成员；否则为尚未投递的成员队列。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainRoute {
    pub origin: MemberId,
    pub members: Option<VecDeque<MemberId>>,
}

impl ChainRoute {
    /// 按给定顺序投递的路由。
    pub fn to_members(origin: MemberId, members: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            origin,
            members: Some(members.into_iter().collect()),
        }
    }

    /// 从发起者开始按环形顺序投递给全部成员的路由。
    pub fn to_all(origin: MemberId) -> Self {
        Self {
            origin,
            members: None,
        }
    }

    pub fn is_all(&self) -> bool {
        self.members.is_none()
    }

    /// 丢弃不在 `view` 中的成员。
    pub fn retain_members(&mut self, view: &MemberSet) {
        if let Some(members) = self.members.as_mut() {
            members.retain(|member| view.contains(*member));
        }
    }

    /// 编码后的字节数。
    pub fn encoded_len(&self) -> usize {
        4 + 2 + self.members.as_ref().map_or(0, |members| members.len() * 4)
    }

    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), GridError> {
        dst.put_i32(member_to_wire(self.origin)?);
        match &self.members {
            None => dst.put_i16(ALL_MEMBERS),
            Some(members) => {
                let count = i16::try_from(members.len()).map_err(|_| GridError::Encode {
                    reason: format!("{} chained members exceed the i16 count field", members.len()),
                })?;
                dst.put_i16(count);
                for member in members {
                    dst.put_i32(member_to_wire(*member)?);
                }
            }
        }
        Ok(())
    }

    /// 解码路由头，丢弃不在 `view` 中的成员。
    pub fn decode(src: &mut impl Buf, view: &MemberSet) -> Result<Self, GridError> {
        let origin = member_from_wire(read_i32(src, "origin")?)?;
        let count = read_i16(src, "member count")?;
        if count == ALL_MEMBERS {
            return Ok(Self::to_all(origin));
        }
        let count = usize::try_from(count)
            .map_err(|_| GridError::decode(format!("negative member count {count}")))?;
        if src.remaining() < count * 4 {
            return Err(GridError::decode(format!(
                "member list truncated: {count} members need {} bytes, {} available",
                count * 4,
                src.remaining()
            )));
        }
        let mut members = VecDeque::with_capacity(count);
        for _ in 0..count {
            let member = member_from_wire(src.get_i32())?;
            if view.contains(member) {
                members.push_back(member);
            }
        }
        Ok(Self {
            origin,
            members: Some(members),
        })
    }

    /// 选出下一跳并从路由中移除。
    ///
    /// 成员列表模式下跳过自身与不在视图中的成员；全部成员模式下取环形后继，
    /// 后继在环上绕回发起者时链路结束。
    fn next_hop(
        &mut self,
        local: MemberId,
        view: &MemberSet,
        successor: impl FnOnce(MemberId) -> Option<MemberId>,
    ) -> Option<MemberId> {
        match self.members.as_mut() {
            Some(members) => {
                while let Some(next) = members.pop_front() {
                    if next != local && view.contains(next) {
                        return Some(next);
                    }
                }
                None
            }
            None => {
                let origin = self.origin;
                successor(local)
                    .filter(|next| ring_position(origin, *next) > ring_position(origin, local))
            }
        }
    }
}

/// 以 `origin` 为起点的环形位置；发起者位置最小。
fn ring_position(origin: MemberId, member: MemberId) -> (bool, MemberId) {
    (member < origin, member)
}

fn member_to_wire(member: MemberId) -> Result<i32, GridError> {
    i32::try_from(member.get()).map_err(|_| GridError::Encode {
        reason: format!("{member} does not fit the i32 member field"),
    })
}

fn member_from_wire(raw: i32) -> Result<MemberId, GridError> {
    u32::try_from(raw)
        .map(MemberId::new)
        .map_err(|_| GridError::decode(format!("negative member id {raw}")))
}

fn read_i32(src: &mut impl Buf, field: &str) -> Result<i32, GridError> {
    if src.remaining() < 4 {
        return Err(GridError::decode(format!("{field} truncated")));
    }
    Ok(src.get_i32())
}

fn read_i16(src: &mut impl Buf, field: &str) -> Result<i16, GridError> {
    if src.remaining() < 2 {
        return Err(GridError::decode(format!("{field} truncated")));
    }
    Ok(src.get_i16())
}

/// 沿成员链逐跳投递的请求。
#[derive(Clone)]
pub struct ChainedRequest {
    pub route: ChainRoute,
    pub payload: Bytes,
    pub options: RequestOptions,
    pub(crate) incoming: Option<Incoming>,
    pub(crate) completion: Option<Arc<ResponseHandle<()>>>,
}

impl ChainedRequest {
    pub fn new(route: ChainRoute, payload: Bytes) -> Self {
        Self {
            route,
            payload,
            options: RequestOptions::default(),
            incoming: None,
            completion: None,
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn origin(&self) -> MemberId {
        self.route.origin
    }

    /// 本跳收到请求时的直接前驱；发起者上为 `None`。
    pub fn predecessor(&self) -> Option<MemberId> {
        self.incoming.map(|incoming| incoming.from)
    }

    /// 编码整个请求：路由头、调度属性与负载。
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<(), GridError> {
        self.route.encode(dst)?;
        dst.put_i32(self.options.scheduling_priority);
        dst.put_u64(self.options.request_timeout_millis);
        dst.put_u64(self.options.execution_timeout_millis);
        let len = u32::try_from(self.payload.len()).map_err(|_| GridError::Encode {
            reason: format!("payload of {} bytes exceeds the u32 length field", self.payload.len()),
        })?;
        dst.put_u32(len);
        dst.put_slice(&self.payload);
        Ok(())
    }

    pub fn decode(src: &mut impl Buf, view: &MemberSet) -> Result<Self, GridError> {
        let route = ChainRoute::decode(src, view)?;
        if src.remaining() < 4 + 8 + 8 + 4 {
            return Err(GridError::decode("request options truncated"));
        }
        let options = RequestOptions {
            scheduling_priority: src.get_i32(),
            request_timeout_millis: src.get_u64(),
            execution_timeout_millis: src.get_u64(),
        };
        let len = src.get_u32() as usize;
        if src.remaining() < len {
            return Err(GridError::decode(format!(
                "payload truncated: expected {len} bytes, {} available",
                src.remaining()
            )));
        }
        let payload = src.copy_to_bytes(len);
        Ok(Self::new(route, payload).with_options(options))
    }

    /// 投递用的副本，不含发送方专用字段。
    pub(crate) fn for_wire(&self) -> Self {
        Self {
            route: self.route.clone(),
            payload: self.payload.clone(),
            options: self.options,
            incoming: None,
            completion: None,
        }
    }
}

impl fmt::Debug for ChainedRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainedRequest")
            .field("route", &self.route)
            .field("payload_len", &self.payload.len())
            .field("options", &self.options)
            .field("incoming", &self.incoming)
            .finish()
    }
}

/// 本跳收到链式请求。
pub(crate) fn receive_chained(
    node: &GridNode,
    from: MemberId,
    poll_id: PollId,
    mut request: ChainedRequest,
) {
    let view = node.context().service_members();
    request.route.retain_members(&view);
    request.incoming = Some(Incoming { from, poll_id });
    request.completion = None;
    node.handler().on_chain_received(node.member(), &request);
    forward_or_reply(node, request);
}

/// 转发给下一跳；没有下一跳时作为末跳结束本跳。
pub(crate) fn forward_or_reply(node: &GridNode, mut request: ChainedRequest) {
    let member = node.member();
    let view = node.context().service_members();
    let next = request
        .route
        .next_hop(member, &view, |of| node.context().successor_member(of));
    let Some(next) = next else {
        finish_hop(node, request, Ok(()));
        return;
    };

    let wire = request.for_wire();
    let options = request.options;
    let tracker = Box::new(ChainPoll {
        request,
        outcome: None,
    });
    let targets: MemberSet = core::iter::once(next).collect();
    if let Some(poll_id) = node.open_poll(targets, &options, tracker) {
        debug!(%member, %next, poll = %poll_id, origin = %wire.origin(), "forwarding chained request");
        node.post_request(next, poll_id, Request::Chained(wire));
    }
}

/// 结束本跳：发起者上通知完成，中间跳向前驱答复。
fn finish_hop(node: &GridNode, request: ChainedRequest, outcome: Result<(), RemoteFailure>) {
    let member = node.member();
    match request.incoming {
        None => {
            if outcome.is_ok() {
                node.handler().on_chain_completed(member, &request);
            }
            debug!(%member, succeeded = outcome.is_ok(), "chained request completed at origin");
            if let Some(handle) = &request.completion {
                handle.complete(outcome.map_err(GridError::Remote));
            }
        }
        Some(incoming) => {
            let response = match outcome {
                Ok(()) => {
                    node.handler().on_chain_delivered(member, &request);
                    Response::Ack
                }
                Err(failure) => Response::Failure(failure),
            };
            node.reply(incoming.from, incoming.poll_id, response);
        }
    }
}

struct ChainPoll {
    request: ChainedRequest,
    outcome: Option<Result<(), RemoteFailure>>,
}

impl RequestPoll for ChainPoll {
    fn on_response(&mut self, _from: MemberId, response: Response) -> Disposition {
        match response {
            Response::Ack => self.outcome = Some(Ok(())),
            Response::Failure(failure) => self.outcome = Some(Err(failure)),
            // 其余响应不构成结果，关闭后按下一跳离开处理。
            _ => {}
        }
        Disposition::CloseNow
    }

    fn on_completion(self: Box<Self>, node: &GridNode, closure: PollClosure) {
        let ChainPoll { request, outcome } = *self;
        if let Some(outcome) = outcome {
            finish_hop(node, request, outcome);
            return;
        }
        if !closure.service_state.is_running() {
            debug!(
                member = %node.member(),
                poll = %closure.poll_id,
                "service stopped while forwarding chained request, abandoning"
            );
            if request.incoming.is_none() {
                if let Some(handle) = &request.completion {
                    handle.complete(Err(GridError::ServiceStopped));
                }
            }
            return;
        }
        debug!(
            member = %node.member(),
            poll = %closure.poll_id,
            departed = ?closure.departed,
            "chained hop left before replying, forwarding again"
        );
        forward_or_reply(node, request);
    }

    fn describe(&self) -> &'static str {
        "chained"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn members(ids: &[u32]) -> MemberSet {
        ids.iter().copied().map(MemberId::new).collect()
    }

    #[test]
    fn next_hop_skips_self_and_departed_members() {
        let view = members(&[1, 2, 9]);
        let mut route = ChainRoute::to_members(
            MemberId::new(1),
            [1, 2, 5, 9].into_iter().map(MemberId::new),
        );
        assert_eq!(route.next_hop(MemberId::new(1), &view, |_| None), Some(MemberId::new(2)));
        assert_eq!(route.next_hop(MemberId::new(2), &view, |_| None), Some(MemberId::new(9)));
        assert_eq!(route.next_hop(MemberId::new(9), &view, |_| None), None);
    }

    #[test]
    fn all_members_route_stops_when_ring_wraps_to_origin() {
        let view = members(&[1, 3, 5, 7]);
        let origin = MemberId::new(5);
        let mut route = ChainRoute::to_all(origin);
        let successor = |of: MemberId| view.successor_of(of);
        assert_eq!(route.next_hop(origin, &view, successor), Some(MemberId::new(7)));
        assert_eq!(route.next_hop(MemberId::new(7), &view, successor), Some(MemberId::new(1)));
        assert_eq!(route.next_hop(MemberId::new(1), &view, successor), Some(MemberId::new(3)));
        assert_eq!(route.next_hop(MemberId::new(3), &view, successor), None);
    }

    #[test]
    fn encode_rejects_oversized_member_list() {
        let route = ChainRoute::to_members(
            MemberId::new(1),
            (0..=i16::MAX as u32 + 1).map(MemberId::new),
        );
        let mut buf = Vec::new();
        assert!(matches!(route.encode(&mut buf), Err(GridError::Encode { .. })));
    }

    #[test]
    fn wire_copy_drops_sender_only_fields() {
        let mut request = ChainedRequest::new(ChainRoute::to_all(MemberId::new(1)), Bytes::new());
        request.incoming = Some(Incoming {
            from: MemberId::new(2),
            poll_id: PollId::new(4),
        });
        request.completion = Some(Arc::new(ResponseHandle::new()));
        let wire = request.for_wire();
        assert!(wire.incoming.is_none());
        assert!(wire.completion.is_none());
        assert_eq!(wire.route, request.route);
    }
}
