//! # Poll：请求/响应追踪原语
//!
//! ## 核心意图（Why）
//! - 一次请求可能发往一个、多个或全部成员，轮询记录每个目标成员是否已经答复或离开；
//! - 最后一个必要的答复或离开通知到达时，轮询进入 `Completing`，随后由节点执行且仅执行一次完成逻辑。
//!
//! ## 状态机（How）
//! - `Open → Completing → Closed`，只允许单向推进；
//! - “单个答复是否满足整个轮询”由请求类型通过 [`RequestPoll`] 决定，轮询本身不区分请求类型；
//! - 超时与成员离开同等处理：待答复成员全部记为离开。
//!
//! ## 契约（What）
//! - [`Poll::close`] 按值消费轮询，完成逻辑因此在类型层面只能运行一次；
//! - 节点先从轮询表移除再调用 `close`，并发的多个完成触发者中只有成功移除的一方会执行完成逻辑。

use core::fmt;

use tracing::trace;

use crate::{
    member::{MemberId, MemberSet},
    message::{PollId, Response},
    node::GridNode,
    service::ServiceState,
};

/// 轮询状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollState {
    /// 仍有待答复成员。
    Open,
    /// 全部目标已答复或离开，等待执行完成逻辑。
    Completing,
    /// 完成逻辑已执行。
    Closed,
}

impl PollState {
    pub fn can_transition_to(self, target: PollState) -> bool {
        matches!(
            (self, target),
            (PollState::Open, PollState::Completing) | (PollState::Completing, PollState::Closed)
        )
    }
}

/// 请求类型对单个答复的判定。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// 该成员已完成答复，其余成员仍需等待。
    MemberDone,
    /// 整个轮询已被满足（或遇到失败），立即进入完成阶段。
    CloseNow,
}

/// 轮询关闭时交给完成逻辑的上下文。
#[derive(Clone, Debug)]
pub struct PollClosure {
    pub poll_id: PollId,
    pub responded: MemberSet,
    pub departed: MemberSet,
    pub service_state: ServiceState,
}

/// 请求类型专属的轮询行为。
///
/// # 教案式说明
/// - **意图 (Why)**：点对点请求一个答复即可关闭，多分区请求要等答复掩码清空，链式请求要根据有无结果决定转发或答复；
///   把“是否已满足”做成虚方法，轮询就无需按请求类型分支；
/// - **契约 (What)**：
///   - `on_response` 记录答复并返回判定；
///   - `on_completion` 在轮询关闭时被调用一次，自行检查是否有可用结果。
pub trait RequestPoll: Send + Sync {
    fn on_response(&mut self, from: MemberId, response: Response) -> Disposition;

    fn on_completion(self: Box<Self>, node: &GridNode, closure: PollClosure);

    fn describe(&self) -> &'static str;
}

/// 一次请求的轮询。
pub struct Poll {
    id: PollId,
    state: PollState,
    remaining: MemberSet,
    responded: MemberSet,
    departed: MemberSet,
    deadline: Option<u64>,
    tracker: Box<dyn RequestPoll>,
}

impl Poll {
    /// 创建轮询；`targets` 中不在 `view` 内的成员直接记为离开。
    pub(crate) fn new(
        id: PollId,
        targets: MemberSet,
        view: &MemberSet,
        deadline: Option<u64>,
        tracker: Box<dyn RequestPoll>,
    ) -> Self {
        let mut remaining = MemberSet::new();
        let mut departed = MemberSet::new();
        for member in targets.iter() {
            if view.contains(member) {
                remaining.insert(member);
            } else {
                departed.insert(member);
            }
        }
        let state = if remaining.is_empty() {
            PollState::Completing
        } else {
            PollState::Open
        };
        Self {
            id,
            state,
            remaining,
            responded: MemberSet::new(),
            departed,
            deadline,
            tracker,
        }
    }

    pub fn id(&self) -> PollId {
        self.id
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    pub fn remaining(&self) -> &MemberSet {
        &self.remaining
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// 记录一个答复。非待答复成员的答复（重复或迟到）被忽略。
    pub(crate) fn on_response(&mut self, from: MemberId, response: Response) -> PollState {
        if self.state != PollState::Open || !self.remaining.contains(from) {
            trace!(poll = %self.id, member = %from, "ignoring response outside the open poll");
            return self.state;
        }
        let disposition = self.tracker.on_response(from, response);
        self.remaining.remove(from);
        self.responded.insert(from);
        trace!(poll = %self.id, member = %from, ?disposition, remaining = self.remaining.len(), "poll response recorded");
        if disposition == Disposition::CloseNow || self.remaining.is_empty() {
            self.transition(PollState::Completing);
        }
        self.state
    }

    /// 记录成员离开。
    pub(crate) fn on_member_left(&mut self, member: MemberId) -> PollState {
        if self.state == PollState::Open && self.remaining.remove(member) {
            self.departed.insert(member);
            trace!(poll = %self.id, %member, "poll member departed");
            if self.remaining.is_empty() {
                self.transition(PollState::Completing);
            }
        }
        self.state
    }

    /// 超时：待答复成员全部视为离开。
    pub(crate) fn on_timeout(&mut self) -> PollState {
        if self.state == PollState::Open {
            let expired = self.remaining.take_all();
            self.departed.extend(expired.iter());
            trace!(poll = %self.id, expired = expired.len(), "poll timed out");
            self.transition(PollState::Completing);
        }
        self.state
    }

    /// 关闭轮询并运行完成逻辑。
    pub(crate) fn close(mut self, node: &GridNode) {
        if self.state == PollState::Open {
            // 显式关闭一个仍在等待的轮询时，剩余成员按离开处理。
            let _ = self.on_timeout();
        }
        self.transition(PollState::Closed);
        let closure = PollClosure {
            poll_id: self.id,
            responded: self.responded,
            departed: self.departed,
            service_state: node.service_state(),
        };
        self.tracker.on_completion(node, closure);
    }

    fn transition(&mut self, target: PollState) {
        if self.state.can_transition_to(target) {
            self.state = target;
        }
    }
}

impl fmt::Debug for Poll {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poll")
            .field("id", &self.id)
            .field("kind", &self.tracker.describe())
            .field("state", &self.state)
            .field("remaining", &self.remaining)
            .field("departed", &self.departed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingTracker {
        responses: usize,
    }

    impl RequestPoll for CountingTracker {
        fn on_response(&mut self, _from: MemberId, _response: Response) -> Disposition {
            self.responses += 1;
            Disposition::MemberDone
        }

        fn on_completion(self: Box<Self>, _node: &GridNode, _closure: PollClosure) {}

        fn describe(&self) -> &'static str {
            "counting"
        }
    }

    fn members(ids: &[u32]) -> MemberSet {
        ids.iter().copied().map(MemberId::new).collect()
    }

    fn open(targets: &[u32], view: &[u32]) -> Poll {
        Poll::new(
            PollId::new(1),
            members(targets),
            &members(view),
            None,
            Box::new(CountingTracker { responses: 0 }),
        )
    }

    #[test]
    fn targets_outside_view_start_as_departed() {
        let poll = open(&[2, 3], &[1, 2]);
        assert_eq!(poll.state(), PollState::Open);
        assert_eq!(poll.remaining(), &members(&[2]));
        assert!(poll.departed.contains(MemberId::new(3)));

        assert_eq!(open(&[5], &[1]).state(), PollState::Completing);
    }

    #[test]
    fn duplicate_and_foreign_responses_are_ignored() {
        let mut poll = open(&[2, 3], &[1, 2, 3]);
        assert_eq!(poll.on_response(MemberId::new(2), Response::Ack), PollState::Open);
        assert_eq!(poll.on_response(MemberId::new(2), Response::Ack), PollState::Open);
        assert_eq!(poll.on_response(MemberId::new(9), Response::Ack), PollState::Open);
        assert_eq!(poll.on_member_left(MemberId::new(3)), PollState::Completing);
        assert_eq!(poll.on_response(MemberId::new(3), Response::Ack), PollState::Completing);
        assert_eq!(poll.responded, members(&[2]));
        assert_eq!(poll.departed, members(&[3]));
    }

    #[test]
    fn timeout_marks_every_remaining_member_departed() {
        let mut poll = open(&[2, 3, 4], &[1, 2, 3, 4]);
        poll.on_response(MemberId::new(4), Response::Ack);
        assert_eq!(poll.on_timeout(), PollState::Completing);
        assert!(poll.remaining().is_empty());
        assert_eq!(poll.departed, members(&[2, 3]));
        assert!(!PollState::Completing.can_transition_to(PollState::Open));
    }
}
