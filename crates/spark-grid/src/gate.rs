use std::{
    cell::RefCell,
    sync::atomic::{AtomicBool, Ordering},
};

use parking_lot::{RwLock, RwLockReadGuard};

use crate::error::GridError;

thread_local! {
    /// 当前线程持有通行凭证的闸门地址。
    static ENTERED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// 预处理闸门。
///
/// # 教案式说明
/// - **意图 (Why)**：并发服务允许在接收线程上直接处理请求，但服务关闭时必须等待这些就地处理全部退出；
/// - **逻辑 (How)**：进入是一次非阻塞的读锁尝试，关闭先置位再获取写锁，写锁返回即代表闸门内已无线程；
/// - **契约 (What)**：[`try_enter`](Self::try_enter) 从不阻塞，失败时调用方退回排队处理；
/// - **风险 (Trade-offs)**：关闭期间新的进入全部失败，请求会堆积到工作队列，由关闭流程决定是否丢弃；
///   在闸门内的线程上调用 [`close`](Self::close) 无法等待自己离开，此时只置位并返回
///   [`GridError::GateReentered`]。
#[derive(Debug, Default)]
pub struct ThreadGate {
    lock: RwLock<()>,
    closed: AtomicBool,
}

/// 闸门内的通行凭证，析构即离开。
pub struct GateGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
    key: usize,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        let key = self.key;
        ENTERED.with(|entered| {
            let mut entered = entered.borrow_mut();
            if let Some(index) = entered.iter().rposition(|held| *held == key) {
                entered.swap_remove(index);
            }
        });
    }
}

impl ThreadGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// 非阻塞地进入闸门。
    pub fn try_enter(&self) -> Option<GateGuard<'_>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let guard = self.lock.try_read()?;
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let key = self.key();
        ENTERED.with(|entered| entered.borrow_mut().push(key));
        Some(GateGuard { _guard: guard, key })
    }

    /// 关闭闸门并等待闸门内的线程全部离开。
    ///
    /// 调用线程自身仍在闸门内时不等待，闸门保持关闭并返回 [`GridError::GateReentered`]。
    pub fn close(&self) -> Result<(), GridError> {
        self.closed.store(true, Ordering::Release);
        if self.entered_by_current_thread() {
            return Err(GridError::GateReentered);
        }
        drop(self.lock.write());
        Ok(())
    }

    /// 当前线程是否持有本闸门的通行凭证。
    pub fn entered_by_current_thread(&self) -> bool {
        let key = self.key();
        ENTERED.with(|entered| entered.borrow().contains(&key))
    }

    pub fn open(&self) {
        self.closed.store(false, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn key(&self) -> usize {
        core::ptr::from_ref(self) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_gate_rejects_entry() {
        let gate = ThreadGate::new();
        {
            let first = gate.try_enter();
            let second = gate.try_enter();
            assert!(first.is_some() && second.is_some(), "闸门允许多个线程同时进入");
        }
        assert_eq!(gate.close(), Ok(()));
        assert!(gate.try_enter().is_none());
        gate.open();
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn close_from_inside_the_gate_fails_instead_of_waiting() {
        let gate = ThreadGate::new();
        let guard = gate.try_enter().expect("闸门初始开启");
        assert!(gate.entered_by_current_thread());

        assert_eq!(gate.close(), Err(GridError::GateReentered));
        assert!(gate.is_closed(), "闸门仍然关闭，新的进入全部失败");
        assert!(gate.try_enter().is_none());

        drop(guard);
        assert!(!gate.entered_by_current_thread());
        assert_eq!(gate.close(), Ok(()));
    }

    #[test]
    fn entry_on_another_thread_is_not_reentrant() {
        let gate = ThreadGate::new();
        let _guard = gate.try_enter().expect("闸门初始开启");
        std::thread::scope(|scope| {
            scope.spawn(|| assert!(!gate.entered_by_current_thread()));
        });
    }
}
