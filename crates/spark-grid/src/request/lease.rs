//! 租约请求：由最老成员统一签发，签发者在答复前离开时向新的最老成员重发。

use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::{
    error::{GridError, RemoteFailure},
    handle::ResponseHandle,
    member::{MemberId, MemberSet},
    message::{PollId, Request, RequestOptions, Response},
    node::GridNode,
    poll::{Disposition, PollClosure, RequestPoll},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaseAction {
    Lock { holder: MemberId },
    Unlock { holder: MemberId },
}

impl LeaseAction {
    pub fn holder(self) -> MemberId {
        match self {
            LeaseAction::Lock { holder } | LeaseAction::Unlock { holder } => holder,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LeaseRequest {
    pub cache_id: u64,
    pub key: Bytes,
    pub action: LeaseAction,
    pub options: RequestOptions,
}

impl LeaseRequest {
    pub fn lock(cache_id: u64, key: impl Into<Bytes>, holder: MemberId) -> Self {
        Self {
            cache_id,
            key: key.into(),
            action: LeaseAction::Lock { holder },
            options: RequestOptions::default(),
        }
    }

    pub fn unlock(cache_id: u64, key: impl Into<Bytes>, holder: MemberId) -> Self {
        Self {
            cache_id,
            key: key.into(),
            action: LeaseAction::Unlock { holder },
            options: RequestOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }
}

/// 签发者的裁决。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeaseGrant {
    pub key: Bytes,
    /// 裁决后的租约持有者。
    pub holder: MemberId,
    pub granted: bool,
}

pub(crate) fn submit_lease(
    node: &GridNode,
    request: LeaseRequest,
    handle: Arc<ResponseHandle<LeaseGrant>>,
    attempt: u32,
) {
    let issuer = node.context().oldest_member();
    let targets: MemberSet = issuer.into_iter().collect();
    let options = request.options;
    let wire = issuer.map(|issuer| (issuer, request.clone()));
    let tracker = Box::new(LeasePoll {
        request,
        handle,
        attempt,
        outcome: None,
    });
    if let Some(poll_id) = node.open_poll(targets, &options, tracker) {
        if let Some((issuer, request)) = wire {
            debug!(member = %node.member(), %issuer, attempt, poll = %poll_id, "sending lease request");
            node.post_request(issuer, poll_id, Request::Lease(request));
        }
    }
}

pub(crate) fn receive_lease(node: &GridNode, from: MemberId, poll_id: PollId, request: LeaseRequest) {
    let response = if node.context().oldest_member() != Some(node.member()) {
        Response::NotOwner
    } else {
        match node.handler().on_lease_request(&request) {
            Ok(grant) => Response::Lease(grant),
            Err(failure) => Response::Failure(failure),
        }
    };
    node.reply(from, poll_id, response);
}

struct LeasePoll {
    request: LeaseRequest,
    handle: Arc<ResponseHandle<LeaseGrant>>,
    attempt: u32,
    outcome: Option<Result<LeaseGrant, RemoteFailure>>,
}

impl RequestPoll for LeasePoll {
    fn on_response(&mut self, _from: MemberId, response: Response) -> Disposition {
        match response {
            Response::Lease(grant) => self.outcome = Some(Ok(grant)),
            Response::Failure(failure) => self.outcome = Some(Err(failure)),
            _ => {}
        }
        Disposition::CloseNow
    }

    fn on_completion(self: Box<Self>, node: &GridNode, closure: PollClosure) {
        let LeasePoll {
            request,
            handle,
            attempt,
            outcome,
        } = *self;
        if let Some(outcome) = outcome {
            handle.complete(outcome.map_err(GridError::Remote));
        } else if !closure.service_state.is_running() {
            handle.complete(Err(GridError::ServiceStopped));
        } else if attempt < node.config().key_request_retry_limit {
            debug!(
                member = %node.member(),
                departed = ?closure.departed,
                "lease issuer left before replying, retrying against the oldest member"
            );
            submit_lease(node, request, handle, attempt + 1);
        } else {
            handle.complete(Err(GridError::ResponseUnknown));
        }
    }

    fn describe(&self) -> &'static str {
        "lease"
    }
}
