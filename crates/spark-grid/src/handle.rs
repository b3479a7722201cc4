use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::error::GridError;

enum Slot<T> {
    Pending,
    Done(Result<T, GridError>),
}

/// 同步调用方等待请求结果的句柄。
///
/// # 教案式说明
/// - **意图 (Why)**：调用线程只阻塞在发起请求的句柄上，不参与中间各跳或各分区的协调；
/// - **逻辑 (How)**：`Mutex` 保存结果槽位，`Condvar` 在首次完成时唤醒全部等待者；
/// - **契约 (What)**：
///   - 结果只写入一次，后续的 `complete` 返回 `false` 并被忽略；
///   - 应用层失败以 `Err(GridError::Remote)` 原样保存，检查结果时直接返回；
/// - **风险 (Trade-offs)**：`check_response` 会无限期阻塞，调用方若需要时限应使用 `wait_timeout`。
pub struct ResponseHandle<T> {
    slot: Mutex<Slot<T>>,
    ready: Condvar,
}

impl<T: Clone> ResponseHandle<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot::Pending),
            ready: Condvar::new(),
        }
    }

    /// 写入结果；已完成时返回 `false`。
    pub fn complete(&self, outcome: Result<T, GridError>) -> bool {
        let mut slot = self.slot.lock();
        if matches!(*slot, Slot::Done(_)) {
            return false;
        }
        *slot = Slot::Done(outcome);
        self.ready.notify_all();
        true
    }

    pub fn is_done(&self) -> bool {
        matches!(*self.slot.lock(), Slot::Done(_))
    }

    /// 非阻塞读取结果。
    pub fn try_outcome(&self) -> Option<Result<T, GridError>> {
        match &*self.slot.lock() {
            Slot::Pending => None,
            Slot::Done(outcome) => Some(outcome.clone()),
        }
    }

    /// 在时限内等待结果，超时返回 `None`。
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, GridError>> {
        let mut slot = self.slot.lock();
        if let Slot::Pending = *slot {
            let _ = self
                .ready
                .wait_while_for(&mut slot, |slot| matches!(slot, Slot::Pending), timeout);
        }
        match &*slot {
            Slot::Pending => None,
            Slot::Done(outcome) => Some(outcome.clone()),
        }
    }

    /// 阻塞直到结果可用并返回；成功值与失败都原样交回。
    pub fn check_response(&self) -> Result<T, GridError> {
        let mut slot = self.slot.lock();
        loop {
            if let Slot::Done(outcome) = &*slot {
                return outcome.clone();
            }
            self.ready.wait(&mut slot);
        }
    }
}

impl<T: Clone> Default for ResponseHandle<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> core::fmt::Debug for ResponseHandle<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let done = matches!(*self.slot.lock(), Slot::Done(_));
        f.debug_struct("ResponseHandle").field("done", &done).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn first_completion_wins() {
        let handle = ResponseHandle::<u32>::new();
        assert!(handle.try_outcome().is_none());
        assert!(handle.complete(Ok(7)));
        assert!(!handle.complete(Err(GridError::ResponseUnknown)), "结果只能写入一次");
        assert_eq!(handle.check_response(), Ok(7));
    }

    #[test]
    fn waiter_is_woken_by_completion() {
        let handle = Arc::new(ResponseHandle::<u32>::new());
        let waiter = {
            let handle = Arc::clone(&handle);
            thread::spawn(move || handle.check_response())
        };
        handle.complete(Err(GridError::ServiceStopped));
        assert_eq!(
            waiter.join().expect("等待线程不应 panic"),
            Err(GridError::ServiceStopped)
        );
    }

    #[test]
    fn wait_timeout_expires_while_pending() {
        let handle = ResponseHandle::<()>::new();
        assert!(handle.wait_timeout(Duration::from_millis(5)).is_none());
    }
}
