//! # SegmentedBufferManager：按尺寸级别路由的分段缓冲管理器
//!
//! ## 核心意图（Why）
//! - 持有一组尺寸几何递增的 [`BufferSegment`]，把每次租借路由到最合适的分段；
//! - 最合适的分段耗尽时先探测相邻分段，只有相邻分段也无法提供池化缓冲时才退化为非池化分配。
//!
//! ## 契约（What）
//! - 可能耗尽内存的操作返回 [`BufferError::OutOfMemory`]，调用方必须降低需求而不是原样重试；
//! - `truncate` 从不丢失内容：要么返回逐字节复制了已写区域的新缓冲，要么原样返回输入；
//! - `dispose` 之后所有租借返回 [`BufferError::Disposed`]，在外缓冲仍可归还（随即被丢弃）。

use std::sync::Arc;

use tracing::debug;

use crate::{
    allocator::{BufferAllocator, HeapAllocator},
    buffer::Buffer,
    config::SegmentedBufferConfig,
    error::BufferError,
    segment::{BufferSegment, PressureEpoch, ShrinkReport},
    stats::PoolStats,
    sync::{AtomicBool, Ordering},
};

/// 判定缓冲是否值得降级的比例：已用字节不超过容量的 `1 / TRUNCATE_RATIO`。
pub const TRUNCATE_RATIO: usize = 2;

/// 缓冲管理器的统一接口。
///
/// # 设计初衷（Why）
/// - [`SegmentedBufferManager`] 与 [`CheckedBufferManager`](crate::CheckedBufferManager)
///   实现同一接口，使诊断包装器可以在不改动调用方的前提下透明替换；
///
/// # 契约定义（What）
/// - `acquire(min)`：返回容量不小于 `min` 的缓冲；
/// - `acquire_pref(pref)`：尽量返回容量接近 `pref` 的缓冲，可能略小；
/// - `acquire_sum(sum)`：为累计写入 `sum` 字节的场景返回一个不超过 `sum` 的最大尺寸缓冲；
/// - `truncate(buffer)`：尝试把利用率低的缓冲换成更小的缓冲；
/// - `release(buffer)`：归还缓冲，未知缓冲返回 [`BufferError::UnknownBuffer`]。
pub trait BufferManager: Send + Sync {
    fn acquire(&self, min_size: usize) -> Result<Buffer, BufferError>;

    fn acquire_pref(&self, pref_size: usize) -> Result<Buffer, BufferError>;

    fn acquire_sum(&self, sum_size: usize) -> Result<Buffer, BufferError>;

    fn truncate(&self, buffer: Buffer) -> Result<Buffer, BufferError>;

    fn release(&self, buffer: Buffer) -> Result<(), BufferError>;

    /// 池化缓冲的最大尺寸。
    fn maximum_capacity(&self) -> usize;

    fn statistics(&self) -> PoolStats;

    fn dispose(&self);
}

/// 分段缓冲管理器。
///
/// # 教案式说明
/// - **意图 (Why)**：以几何递增的尺寸级别覆盖从小报文到大批量写入的需求，同时限制池化总预算；
/// - **逻辑 (How)**：
///   - 最佳分段是尺寸不小于请求的最小分段；
///   - 最佳分段耗尽时按 `index + 1`、`index + 2` 的顺序探测更大的邻居，
///     `acquire_pref` 还会交替探测更小的邻居；
///   - 探测全部落空后在最佳分段上强制分配非池化缓冲；
///   - 超出最大分段的请求直接分配精确尺寸的非池化缓冲，归还即丢弃；
/// - **契约 (What)**：共享同一个 [`BufferAllocator`]，缓冲标识在全部分段间唯一；
/// - **风险 (Trade-offs)**：探测邻居会让调用方偶尔拿到更大的缓冲，以少量内存浪费换取更少的分配。
pub struct SegmentedBufferManager {
    segments: Vec<BufferSegment>,
    pressure: Arc<PressureEpoch>,
    allocator: Arc<dyn BufferAllocator>,
    disposed: AtomicBool,
}

impl SegmentedBufferManager {
    /// 使用默认堆分配器构造。
    pub fn new(config: SegmentedBufferConfig) -> Result<Self, BufferError> {
        Self::with_allocator(config, Arc::new(HeapAllocator::new()))
    }

    pub fn with_allocator(
        config: SegmentedBufferConfig,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Self, BufferError> {
        let layouts = config.segment_layouts()?;
        let pressure = Arc::new(PressureEpoch::new());
        let segments = layouts
            .into_iter()
            .map(|layout| {
                BufferSegment::new(
                    layout,
                    Arc::clone(&allocator),
                    Arc::clone(&pressure),
                    config.stats_frequency,
                    config.shrink_requires_pressure,
                )
            })
            .collect();
        Ok(Self {
            segments,
            pressure,
            allocator,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> Option<&BufferSegment> {
        self.segments.get(index)
    }

    pub fn allocator(&self) -> &Arc<dyn BufferAllocator> {
        &self.allocator
    }

    /// 通知管理器出现了内存压力。
    ///
    /// 递增压力纪元并立即对每个分段执行一次收缩评估，返回实际发生的收缩。
    pub fn signal_memory_pressure(&self) -> Vec<ShrinkReport> {
        let epoch = self.pressure.bump();
        let reports: Vec<ShrinkReport> = self
            .segments
            .iter()
            .filter_map(|segment| segment.evaluate(true))
            .collect();
        debug!(epoch, shrunk = reports.len(), "memory pressure evaluated");
        reports
    }

    /// 尺寸不小于 `size` 的最小分段下标；超出全部分段时返回 `None`。
    fn best_fit(&self, size: usize) -> Option<usize> {
        self.segments
            .iter()
            .position(|segment| segment.buffer_size() >= size)
    }

    /// 尺寸不超过 `size` 的最大分段下标；小于最小分段时返回 0。
    fn floor_fit(&self, size: usize) -> usize {
        self.segments
            .iter()
            .rposition(|segment| segment.buffer_size() <= size)
            .unwrap_or(0)
    }

    fn last_index(&self) -> usize {
        self.segments.len() - 1
    }

    fn ensure_live(&self) -> Result<(), BufferError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(BufferError::Disposed);
        }
        Ok(())
    }

    /// 依次探测候选分段，全部落空时在 `index` 上强制分配。
    fn acquire_from(
        &self,
        index: usize,
        candidates: impl IntoIterator<Item = usize>,
    ) -> Result<Buffer, BufferError> {
        for candidate in candidates {
            if let Some(segment) = self.segments.get(candidate)
                && let Some(buffer) = segment.acquire(false)?
            {
                return Ok(buffer);
            }
        }
        let segment = &self.segments[index];
        segment.acquire(true)?.ok_or(BufferError::OutOfMemory {
            requested: segment.buffer_size(),
        })
    }

    /// 在指定分段上做一次不强制的租借，供截断使用。
    fn try_acquire_pooled(&self, index: usize) -> Result<Option<Buffer>, BufferError> {
        match self.segments.get(index) {
            Some(segment) => segment.acquire(false),
            None => Ok(None),
        }
    }
}

impl BufferManager for SegmentedBufferManager {
    fn acquire(&self, min_size: usize) -> Result<Buffer, BufferError> {
        self.ensure_live()?;
        let Some(index) = self.best_fit(min_size) else {
            let last = &self.segments[self.last_index()];
            return last.acquire_oversize(min_size);
        };
        self.acquire_from(index, [index, index + 1, index + 2])
    }

    fn acquire_pref(&self, pref_size: usize) -> Result<Buffer, BufferError> {
        self.ensure_live()?;
        let index = self.best_fit(pref_size).unwrap_or(self.last_index());
        let mut candidates = vec![index, index + 1];
        if let Some(smaller) = index.checked_sub(1) {
            candidates.push(smaller);
        }
        self.acquire_from(index, candidates)
    }

    fn acquire_sum(&self, sum_size: usize) -> Result<Buffer, BufferError> {
        self.ensure_live()?;
        let index = self.floor_fit(sum_size);
        self.acquire_from(index, [index])
    }

    /// 截断。
    ///
    /// # 执行步骤（How）
    /// 1. 目标分段为能容纳已写区域的最小分段，且必须严格小于当前分段；
    /// 2. 只有已写字节不超过容量的 `1 / TRUNCATE_RATIO` 才值得搬迁；
    /// 3. 目标分段以不强制方式租借，失败时原样返回输入；
    /// 4. 复制已写区域并保持 `position`，随后归还原缓冲。
    fn truncate(&self, buffer: Buffer) -> Result<Buffer, BufferError> {
        if usize::from(buffer.tag().segment) >= self.segments.len() {
            return Err(BufferError::UnknownBuffer { id: buffer.id() });
        }
        if self.disposed.load(Ordering::Acquire) {
            return Ok(buffer);
        }
        let used = buffer.position();
        if used.saturating_mul(TRUNCATE_RATIO) > buffer.capacity() {
            return Ok(buffer);
        }
        let Some(target) = self.best_fit(used.max(1)) else {
            return Ok(buffer);
        };
        if self.segments[target].buffer_size() >= buffer.capacity() {
            return Ok(buffer);
        }

        let mut smaller = match self.try_acquire_pooled(target) {
            Ok(Some(smaller)) => smaller,
            Ok(None) | Err(_) => return Ok(buffer),
        };
        smaller.put_slice(buffer.written());
        self.release(buffer)?;
        Ok(smaller)
    }

    fn release(&self, buffer: Buffer) -> Result<(), BufferError> {
        let tag = buffer.tag();
        let Some(segment) = self.segments.get(usize::from(tag.segment)) else {
            return Err(BufferError::UnknownBuffer { id: buffer.id() });
        };
        // 超尺寸缓冲容量与分段不符，分段归还路径会直接交还分配器。
        segment.release(buffer);
        Ok(())
    }

    fn maximum_capacity(&self) -> usize {
        self.segments[self.last_index()].buffer_size()
    }

    fn statistics(&self) -> PoolStats {
        PoolStats::from_segments(self.segments.iter().map(BufferSegment::stats).collect())
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let reclaimed: usize = self.segments.iter().map(BufferSegment::dispose).sum();
        debug!(reclaimed, "segmented buffer manager disposed");
    }
}
