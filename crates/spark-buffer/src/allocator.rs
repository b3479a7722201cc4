use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::BytesMut;

use crate::error::BufferError;

/// 原始内存来源。
///
/// # 设计初衷（Why）
/// - 分段只负责“池化策略”，真正的内存获取与归还交给分配器，使堆内存、直接内存或
///   测试用的限额分配器可以互换；
/// - `release` 对应显式的底层释放，分段在收缩或丢弃高代缓冲时调用。
///
/// # 契约定义（What）
/// - `allocate(size)` 返回长度恰为 `size` 且内容全零的 `BytesMut`，失败时返回
///   [`BufferError::OutOfMemory`]；
/// - `release` 不得 panic，它运行在归还与收缩路径上。
pub trait BufferAllocator: Send + Sync + 'static {
    fn allocate(&self, size: usize) -> Result<BytesMut, BufferError>;

    fn release(&self, bytes: BytesMut);
}

/// 基于堆的默认分配器，可选设置硬性字节上限。
///
/// 上限用于在测试与受限部署中触发内存耗尽路径；计数采用原子操作，多个分段可共享同一实例。
#[derive(Debug, Default)]
pub struct HeapAllocator {
    limit: Option<usize>,
    allocated: AtomicUsize,
    allocations: AtomicU64,
    releases: AtomicU64,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// 创建带字节上限的分配器，超过上限的分配返回 `OutOfMemory`。
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// 当前仍由调用方持有的字节数。
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn allocation_count(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn release_count(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, size: usize) -> Result<BytesMut, BufferError> {
        let limit = self.limit;
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.checked_add(size)?;
                match limit {
                    Some(limit) if next > limit => None,
                    _ => Some(next),
                }
            })
            .map_err(|_| BufferError::OutOfMemory { requested: size })?;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Ok(BytesMut::zeroed(size))
    }

    fn release(&self, bytes: BytesMut) {
        let size = bytes.len();
        let _ = self
            .allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            });
        self.releases.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_rejects_oversized_allocation() {
        let allocator = HeapAllocator::with_limit(100);
        let first = allocator.allocate(60).expect("首个分配应在上限之内");
        assert_eq!(
            allocator.allocate(60),
            Err(BufferError::OutOfMemory { requested: 60 })
        );
        allocator.release(first);
        assert_eq!(allocator.allocated_bytes(), 0);
        assert!(allocator.allocate(60).is_ok(), "归还后额度应恢复");
    }

    #[test]
    fn allocation_is_zeroed_and_exact() {
        let allocator = HeapAllocator::new();
        let bytes = allocator.allocate(32).expect("无上限分配不应失败");
        assert_eq!(bytes.len(), 32);
        assert!(bytes.iter().all(|b| *b == 0));
    }
}
