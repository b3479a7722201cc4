//! 并发原语垫片。
//!
//! 常规构建使用 `core::sync::atomic` 与 `spin::Mutex`；在 `--cfg loom` 下切换为 loom 的
//! 对应实现，使分段的 CAS 状态机可以被 `loom::model` 穷举调度交错。

#[cfg(not(any(loom, spark_loom)))]
pub(crate) use core::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
#[cfg(any(loom, spark_loom))]
pub(crate) use loom::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// 让出当前线程，等待持有尺寸锁的线程完成扩容或收缩。
pub(crate) fn backoff() {
    #[cfg(any(loom, spark_loom))]
    loom::thread::yield_now();
    #[cfg(not(any(loom, spark_loom)))]
    std::thread::yield_now();
}

/// 后进先出的空闲缓冲栈。
///
/// # 设计说明（Why / How）
/// - 分段依赖 LIFO 顺序让热缓冲优先复用，因此收缩时必须立即从栈中剔除高代缓冲，
///   否则它们可能被无限期保留在栈底；
/// - 临界区只包含 `Vec` 的 push/pop，沿用 `spin::Mutex` 保持与原有自由链表一致的开销模型；
/// - 这不是无锁栈：push/pop 在争用时会自旋，但收缩时按代剔除需要对整栈做一次原子的遍历，
///   无锁 Treiber 栈做不到这一点。
pub(crate) struct FreeStack<T> {
    #[cfg(not(any(loom, spark_loom)))]
    inner: spin::Mutex<Vec<T>>,
    #[cfg(any(loom, spark_loom))]
    inner: loom::sync::Mutex<Vec<T>>,
}

impl<T> FreeStack<T> {
    pub(crate) fn new() -> Self {
        Self {
            #[cfg(not(any(loom, spark_loom)))]
            inner: spin::Mutex::new(Vec::new()),
            #[cfg(any(loom, spark_loom))]
            inner: loom::sync::Mutex::new(Vec::new()),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> R {
        #[cfg(not(any(loom, spark_loom)))]
        let mut guard = self.inner.lock();
        #[cfg(any(loom, spark_loom))]
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub(crate) fn push(&self, value: T) {
        self.with(|stack| stack.push(value));
    }

    pub(crate) fn pop(&self) -> Option<T> {
        self.with(Vec::pop)
    }

    pub(crate) fn extend(&self, values: impl IntoIterator<Item = T>) {
        self.with(|stack| stack.extend(values));
    }

    pub(crate) fn len(&self) -> usize {
        self.with(|stack| stack.len())
    }

    /// 保留满足谓词的元素，返回被剔除的元素。
    pub(crate) fn split_off_where(&self, mut discard: impl FnMut(&T) -> bool) -> Vec<T> {
        self.with(|stack| {
            let mut kept = Vec::with_capacity(stack.len());
            let mut removed = Vec::new();
            for value in stack.drain(..) {
                if discard(&value) {
                    removed.push(value);
                } else {
                    kept.push(value);
                }
            }
            *stack = kept;
            removed
        })
    }

    pub(crate) fn drain_all(&self) -> Vec<T> {
        self.with(core::mem::take)
    }
}
