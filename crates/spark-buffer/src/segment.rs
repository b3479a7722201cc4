//! # BufferSegment：单一尺寸级别的分代缓冲池
//!
//! ## 核心意图（Why）
//! - 在“复用缓冲”与“控制常驻内存”之间取得平衡：负载上升时按代批量扩容，负载回落后按代收缩；
//! - 租借路径永不等待归还，只有三种结局：从池中取得、扩容一代后取得、或退化为非池化分配。
//!
//! ## 状态机（How）
//! - `ResizeState` 以单个原子字节表示 `Idle / Growing / Shrinking`，CAS 成功者独占扩容或收缩；
//! - 失败者让出线程后重新尝试弹栈，因此代计数只会被持锁者加一，不会被并发地重复推进；
//! - 收缩评估在持有 `Shrinking` 时立即把高于目标代的空闲缓冲从栈中剔除并交还分配器。
//!
//! ## 契约（What）
//! - 缓冲标签中的代在其生命周期内不变；分段的目标代可以下降，下降后归还的高代缓冲被丢弃；
//! - 非池化缓冲最多被复用 [`UNPOOLED_RECLAIM_INTERVAL`] 次，之后真正交还分配器；
//! - 高水位在每次评估后折半，避免一次历史尖峰让池永久过量保留。

use std::sync::Arc;

use tracing::{debug, trace};

use crate::{
    allocator::BufferAllocator,
    buffer::{Buffer, BufferId, BufferTag, Generation},
    config::SegmentLayout,
    error::BufferError,
    stats::SegmentStats,
    sync::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, FreeStack, Ordering, backoff},
};

/// 代标识可用的位数；最高的标识保留给非池化缓冲。
pub const GENERATION_ID_BITS: u32 = 4;

/// 每个分段可池化的最大代数。
pub const MAX_POOLED_GENERATIONS: u16 = (1 << GENERATION_ID_BITS) - 1;

/// 非池化缓冲在真正丢弃前允许的复用次数。
pub const UNPOOLED_RECLAIM_INTERVAL: u32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum ResizeState {
    Idle = 0,
    Growing = 1,
    Shrinking = 2,
}

impl ResizeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ResizeState::Growing,
            2 => ResizeState::Shrinking,
            _ => ResizeState::Idle,
        }
    }
}

/// 进程级缓冲标识发号器。
///
/// 标识在全部管理器之间唯一，诊断包装器据此区分“重复释放”与“来自其他管理器的缓冲”。
/// 发号器不参与分段的并发协议，因此始终使用标准库原子类型。
static NEXT_BUFFER_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);

fn next_buffer_id() -> BufferId {
    BufferId::new(NEXT_BUFFER_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed))
}

/// 内存压力纪元。
///
/// 每次宿主发出内存压力信号时递增；分段在扩容时记录当时的纪元，
/// 用于判断“自上次扩容以来是否出现过压力”，从而决定周期性收缩是否有资格进行。
#[derive(Debug)]
pub(crate) struct PressureEpoch(AtomicU64);

impl PressureEpoch {
    pub(crate) fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub(crate) fn current(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// 一次收缩的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShrinkReport {
    pub segment: u8,
    pub from_generations: u16,
    pub to_generations: u16,
    pub reclaimed_buffers: usize,
}

enum GrowOutcome {
    /// 持锁期间发现其他线程已压入的空闲缓冲，无需扩容。
    Available(Buffer),
    Grown(Buffer),
    Exhausted,
    Failed(BufferError),
}

/// 单一尺寸级别的分代缓冲池。
///
/// # 教案式说明
/// - **意图 (Why)**：把“扩容一代/收缩若干代”的决策限定在单个尺寸级别内，
///   让管理器只负责路由；
/// - **契约 (What)**：
///   - [`acquire`](Self::acquire)：`ensure_non_pooled` 为 `false` 时代空间耗尽返回 `Ok(None)`，
///     供管理器探测相邻分段；为 `true` 时退化为非池化分配，分配失败返回 `OutOfMemory`；
///   - [`release`](Self::release)：按标签中的代决定回栈或丢弃，每 `stats_frequency` 次归还触发一次收缩评估；
///   - [`evaluate_shrink`](Self::evaluate_shrink)：立即执行一次评估，返回收缩结果；
/// - **风险 (Trade-offs)**：收缩期间归还的缓冲仍会回栈，可能暂时保留已被淘汰的代，
///   它们要等到再次被租出并归还时才会被丢弃。
pub struct BufferSegment {
    layout: SegmentLayout,
    allocator: Arc<dyn BufferAllocator>,
    pressure: Arc<PressureEpoch>,
    free: FreeStack<Buffer>,
    live_generations: AtomicU32,
    state: AtomicU8,
    acquired: AtomicU64,
    released: AtomicU64,
    outstanding: AtomicUsize,
    high_water: AtomicUsize,
    resident_bytes: AtomicUsize,
    unpooled_allocations: AtomicU64,
    failed_acquisitions: AtomicU64,
    pressure_at_growth: AtomicU64,
    stats_frequency: u64,
    shrink_requires_pressure: bool,
}

impl BufferSegment {
    pub(crate) fn new(
        layout: SegmentLayout,
        allocator: Arc<dyn BufferAllocator>,
        pressure: Arc<PressureEpoch>,
        stats_frequency: u64,
        shrink_requires_pressure: bool,
    ) -> Self {
        Self {
            layout,
            allocator,
            pressure,
            free: FreeStack::new(),
            live_generations: AtomicU32::new(0),
            state: AtomicU8::new(ResizeState::Idle as u8),
            acquired: AtomicU64::new(0),
            released: AtomicU64::new(0),
            outstanding: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            resident_bytes: AtomicUsize::new(0),
            unpooled_allocations: AtomicU64::new(0),
            failed_acquisitions: AtomicU64::new(0),
            pressure_at_growth: AtomicU64::new(0),
            stats_frequency: stats_frequency.max(1),
            shrink_requires_pressure,
        }
    }

    pub fn index(&self) -> u8 {
        self.layout.index
    }

    /// 该分段缓冲的名义容量。
    pub fn buffer_size(&self) -> usize {
        self.layout.buffer_size
    }

    /// 当前目标代数。
    pub fn live_generations(&self) -> u16 {
        self.live_generations.load(Ordering::Acquire) as u16
    }

    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    /// 租借一个缓冲。
    ///
    /// # 执行步骤（How）
    /// 1. 空闲栈非空则直接弹出；
    /// 2. 否则尝试以 CAS 取得 `Growing`，成功者先复查空闲栈，仍为空才分配下一代并把多余缓冲压栈；
    /// 3. CAS 失败者让出线程后回到第 1 步，由于持锁者随后会压栈，失败者通常能直接取得缓冲；
    /// 4. 代空间耗尽时，按 `ensure_non_pooled` 决定返回 `None` 还是分配非池化缓冲。
    pub fn acquire(&self, ensure_non_pooled: bool) -> Result<Option<Buffer>, BufferError> {
        loop {
            if let Some(buffer) = self.free.pop() {
                return Ok(Some(self.hand_out(buffer)));
            }
            if !self.try_lock(ResizeState::Growing) {
                backoff();
                continue;
            }
            let outcome = self.grow_locked();
            self.unlock();
            match outcome {
                GrowOutcome::Available(buffer) | GrowOutcome::Grown(buffer) => {
                    return Ok(Some(self.hand_out(buffer)));
                }
                GrowOutcome::Exhausted => break,
                GrowOutcome::Failed(err) => {
                    self.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
                    return if ensure_non_pooled { Err(err) } else { Ok(None) };
                }
            }
        }

        if !ensure_non_pooled {
            return Ok(None);
        }
        self.allocate_unpooled(self.layout.buffer_size).map(Some)
    }

    /// 分配一个超出全部尺寸级别的非池化缓冲，归还时总是被丢弃。
    pub(crate) fn acquire_oversize(&self, size: usize) -> Result<Buffer, BufferError> {
        self.allocate_unpooled(size)
    }

    /// 归还缓冲。
    ///
    /// - 池化缓冲：标签代低于当前目标代，或分段正处于扩缩容中，则回栈；否则交还分配器；
    /// - 非池化缓冲：容量与分段一致且复用次数未超过上限则回栈，否则交还分配器。
    pub fn release(&self, mut buffer: Buffer) {
        let released = self.released.fetch_add(1, Ordering::AcqRel) + 1;
        saturating_decrement(&self.outstanding);

        let keep = match buffer.tag().generation {
            Generation::Unpooled => {
                buffer.capacity() == self.layout.buffer_size
                    && buffer.note_reuse() <= UNPOOLED_RECLAIM_INTERVAL
            }
            Generation::Pooled(generation) => {
                u32::from(generation) < self.live_generations.load(Ordering::Acquire)
                    || self.state() != ResizeState::Idle
            }
        };

        if keep {
            buffer.clear();
            self.free.push(buffer);
        } else {
            trace!(segment = self.layout.index, buffer = %buffer.id(), "discarding buffer outside retained generations");
            self.discard(buffer);
        }

        if released % self.stats_frequency == 0 {
            let _ = self.evaluate(false);
        }
    }

    /// 立即执行一次收缩评估，忽略内存压力门槛。
    pub fn evaluate_shrink(&self) -> Option<ShrinkReport> {
        self.evaluate(true)
    }

    /// 收缩评估。
    ///
    /// # 执行步骤（How）
    /// 1. 目标代数取 `ceil(max(在用, 高水位) / 每代缓冲数)`；
    /// 2. 高水位折半（不低于当前在用数），开始新的观测窗口；
    /// 3. 若目标低于当前代数，CAS 取得 `Shrinking`，在锁内重新读取代数并立即剔除高代空闲缓冲；
    /// 4. 释放锁后把剔除的缓冲交还分配器。
    pub(crate) fn evaluate(&self, pressure_triggered: bool) -> Option<ShrinkReport> {
        let live = self.live_generations.load(Ordering::Acquire);
        if live == 0 {
            return None;
        }

        let in_use = self.outstanding.load(Ordering::Acquire);
        let peak = self.high_water.load(Ordering::Acquire);
        let _ = self
            .high_water
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |hw| {
                Some((hw / 2).max(in_use))
            });

        if !pressure_triggered
            && self.shrink_requires_pressure
            && self.pressure.current() == self.pressure_at_growth.load(Ordering::Acquire)
        {
            return None;
        }

        let needed = in_use
            .max(peak)
            .div_ceil(self.layout.buffers_per_generation) as u32;
        if needed >= live || !self.try_lock(ResizeState::Shrinking) {
            return None;
        }

        let live = self.live_generations.load(Ordering::Acquire);
        if needed >= live {
            self.unlock();
            return None;
        }
        let reclaimed = self.free.split_off_where(|buffer| match buffer.tag().generation {
            Generation::Pooled(generation) => u32::from(generation) >= needed,
            Generation::Unpooled => true,
        });
        self.live_generations.store(needed, Ordering::Release);
        self.unlock();

        let report = ShrinkReport {
            segment: self.layout.index,
            from_generations: live as u16,
            to_generations: needed as u16,
            reclaimed_buffers: reclaimed.len(),
        };
        for buffer in reclaimed {
            self.discard(buffer);
        }
        debug!(
            segment = report.segment,
            from = report.from_generations,
            to = report.to_generations,
            reclaimed = report.reclaimed_buffers,
            "buffer segment shrunk"
        );
        Some(report)
    }

    /// 释放全部空闲缓冲并将代数归零；在用缓冲归还时会被丢弃。
    pub(crate) fn dispose(&self) -> usize {
        while !self.try_lock(ResizeState::Shrinking) {
            backoff();
        }
        let drained = self.free.drain_all();
        self.live_generations.store(0, Ordering::Release);
        self.unlock();
        let count = drained.len();
        for buffer in drained {
            self.discard(buffer);
        }
        count
    }

    pub fn stats(&self) -> SegmentStats {
        let free_buffers = self.free.len();
        SegmentStats {
            index: self.layout.index,
            buffer_size: self.layout.buffer_size,
            live_generations: self.live_generations(),
            max_generations: self.layout.max_generations,
            buffers_per_generation: self.layout.buffers_per_generation,
            free_buffers,
            outstanding: self.outstanding.load(Ordering::Acquire),
            high_water: self.high_water.load(Ordering::Acquire),
            acquired: self.acquired.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            resident_bytes: self.resident_bytes.load(Ordering::Relaxed),
            available_bytes: free_buffers * self.layout.buffer_size,
            unpooled_allocations: self.unpooled_allocations.load(Ordering::Relaxed),
            failed_acquisitions: self.failed_acquisitions.load(Ordering::Relaxed),
        }
    }

    /// 持有 `Growing` 锁时调用：弹栈失败与取锁之间，上一个持锁者可能已经压入了新一代。
    fn grow_locked(&self) -> GrowOutcome {
        match self.free.pop() {
            Some(buffer) => GrowOutcome::Available(buffer),
            None => self.grow(),
        }
    }

    fn grow(&self) -> GrowOutcome {
        let generation = self.live_generations.load(Ordering::Acquire);
        if generation >= u32::from(self.layout.max_generations) {
            return GrowOutcome::Exhausted;
        }

        let tag = BufferTag {
            segment: self.layout.index,
            generation: Generation::Pooled(generation as u16),
        };
        let mut fresh = Vec::with_capacity(self.layout.buffers_per_generation);
        for _ in 0..self.layout.buffers_per_generation {
            match self.allocator.allocate(self.layout.buffer_size) {
                Ok(bytes) => fresh.push(Buffer::new(next_buffer_id(), tag, bytes)),
                Err(err) if fresh.is_empty() => return GrowOutcome::Failed(err),
                // 部分分配成功时仍然成立一代，只是容量较小。
                Err(_) => break,
            }
        }
        self.resident_bytes
            .fetch_add(fresh.len() * self.layout.buffer_size, Ordering::Relaxed);

        let Some(first) = fresh.pop() else {
            return GrowOutcome::Exhausted;
        };
        self.free.extend(fresh);
        self.live_generations.store(generation + 1, Ordering::Release);
        self.pressure_at_growth
            .store(self.pressure.current(), Ordering::Release);
        debug!(
            segment = self.layout.index,
            generation,
            buffer_size = self.layout.buffer_size,
            "buffer segment grew by one generation"
        );
        GrowOutcome::Grown(first)
    }

    fn allocate_unpooled(&self, size: usize) -> Result<Buffer, BufferError> {
        let bytes = self.allocator.allocate(size).inspect_err(|_| {
            self.failed_acquisitions.fetch_add(1, Ordering::Relaxed);
        })?;
        self.unpooled_allocations.fetch_add(1, Ordering::Relaxed);
        self.resident_bytes.fetch_add(size, Ordering::Relaxed);
        let tag = BufferTag {
            segment: self.layout.index,
            generation: Generation::Unpooled,
        };
        Ok(self.hand_out(Buffer::new(next_buffer_id(), tag, bytes)))
    }

    fn hand_out(&self, mut buffer: Buffer) -> Buffer {
        buffer.clear();
        self.acquired.fetch_add(1, Ordering::Relaxed);
        let in_use = self.outstanding.fetch_add(1, Ordering::AcqRel) + 1;
        self.high_water.fetch_max(in_use, Ordering::AcqRel);
        buffer
    }

    fn discard(&self, buffer: Buffer) {
        let capacity = buffer.capacity();
        let _ = self
            .resident_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                Some(current.saturating_sub(capacity))
            });
        self.allocator.release(buffer.into_bytes());
    }

    fn state(&self) -> ResizeState {
        ResizeState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn try_lock(&self, target: ResizeState) -> bool {
        self.state
            .compare_exchange(
                ResizeState::Idle as u8,
                target as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn unlock(&self) {
        self.state.store(ResizeState::Idle as u8, Ordering::Release);
    }
}

fn saturating_decrement(target: &AtomicUsize) {
    let _ = target.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
        Some(current.saturating_sub(1))
    });
}

#[cfg(all(test, not(any(loom, spark_loom))))]
mod tests {
    use super::*;
    use crate::allocator::HeapAllocator;

    fn segment(buffers_per_generation: usize, max_generations: u16) -> (BufferSegment, Arc<HeapAllocator>) {
        let allocator = Arc::new(HeapAllocator::new());
        let segment = BufferSegment::new(
            SegmentLayout {
                index: 0,
                buffer_size: 64,
                buffers_per_generation,
                max_generations,
            },
            allocator.clone(),
            Arc::new(PressureEpoch::new()),
            u64::MAX,
            false,
        );
        (segment, allocator)
    }

    #[test]
    fn first_acquire_grows_exactly_one_generation() {
        let (segment, allocator) = segment(4, 3);
        let buffer = segment
            .acquire(false)
            .expect("无上限分配器不应失败")
            .expect("首代应可分配");
        assert_eq!(buffer.tag().generation, Generation::Pooled(0));
        assert_eq!(segment.live_generations(), 1);
        assert_eq!(segment.stats().free_buffers, 3, "一代 4 个缓冲，租出 1 个后剩 3 个");
        assert_eq!(allocator.allocation_count(), 4);
    }

    /// 弹栈落空的线程随后取得尺寸锁时，其他线程已压入的缓冲必须先被取用。
    #[test]
    fn late_lock_holder_takes_pushed_buffer_instead_of_growing() {
        let (segment, allocator) = segment(2, 4);
        let first = segment.acquire(false).expect("ok").expect("第 0 代");
        assert_eq!(segment.stats().free_buffers, 1);

        assert!(segment.try_lock(ResizeState::Growing));
        let outcome = segment.grow_locked();
        segment.unlock();

        let GrowOutcome::Available(second) = outcome else {
            panic!("空闲栈非空时不应扩容");
        };
        assert_eq!(second.tag().generation, Generation::Pooled(0));
        assert_eq!(segment.live_generations(), 1, "只扩容一代");
        assert_eq!(allocator.allocation_count(), 2);
        segment.release(first);
        segment.release(second);
    }

    #[test]
    fn exhausted_generations_return_none_unless_forced() {
        let (segment, _) = segment(1, 2);
        let first = segment.acquire(false).expect("ok").expect("第 0 代");
        let second = segment.acquire(false).expect("ok").expect("第 1 代");
        assert!(segment.acquire(false).expect("ok").is_none(), "代空间耗尽时探测返回 None");

        let forced = segment.acquire(true).expect("ok").expect("强制分配非池化缓冲");
        assert_eq!(forced.tag().generation, Generation::Unpooled);
        assert_eq!(segment.stats().unpooled_allocations, 1);

        segment.release(first);
        segment.release(second);
        segment.release(forced);
        assert_eq!(segment.stats().outstanding, 0);
    }

    #[test]
    fn unpooled_buffer_is_reused_a_bounded_number_of_times() {
        let (segment, allocator) = segment(1, 1);
        let pooled = segment.acquire(false).expect("ok").expect("第 0 代");
        let mut unpooled = segment.acquire(true).expect("ok").expect("非池化");
        let id = unpooled.id();
        // 池化缓冲保持在外，使后续租借总是取回同一个非池化缓冲。
        for _ in 0..UNPOOLED_RECLAIM_INTERVAL {
            segment.release(unpooled);
            unpooled = segment.acquire(true).expect("ok").expect("复用");
            assert_eq!(unpooled.id(), id, "复用窗口内应取回同一缓冲");
        }
        let releases_before = allocator.release_count();
        segment.release(unpooled);
        assert_eq!(allocator.release_count(), releases_before + 1, "超过复用上限后必须真正丢弃");
        segment.release(pooled);
    }

    #[test]
    fn shrink_drops_free_buffers_above_target_generation() {
        let (segment, allocator) = segment(2, 4);
        let held: Vec<Buffer> = (0..6)
            .map(|_| segment.acquire(false).expect("ok").expect("可扩容"))
            .collect();
        assert_eq!(segment.live_generations(), 3);
        for buffer in held {
            segment.release(buffer);
        }

        // 第一次评估：高水位 6 → 需要 3 代，不收缩，但高水位折半为 3。
        assert_eq!(segment.evaluate_shrink(), None);
        // 第二次评估：高水位 3 → 需要 2 代。
        let report = segment.evaluate_shrink().expect("应收缩一代");
        assert_eq!(report.from_generations, 3);
        assert_eq!(report.to_generations, 2);
        assert_eq!(report.reclaimed_buffers, 2);
        assert_eq!(segment.stats().free_buffers, 4);
        assert_eq!(allocator.release_count(), 2);
    }

    #[test]
    fn buffers_from_retired_generation_are_dropped_on_release() {
        let (segment, allocator) = segment(1, 4);
        let a = segment.acquire(false).expect("ok").expect("第 0 代");
        let b = segment.acquire(false).expect("ok").expect("第 1 代");
        segment.release(a);
        // 在用 1，高水位 2 → 折半两次后只需 1 代。
        let _ = segment.evaluate_shrink();
        let report = segment.evaluate_shrink().expect("收缩到 1 代");
        assert_eq!(report.to_generations, 1);
        assert_eq!(b.tag().generation, Generation::Pooled(1));
        let before = allocator.release_count();
        segment.release(b);
        assert_eq!(allocator.release_count(), before + 1, "第 1 代已被淘汰，归还即丢弃");
    }

    #[test]
    fn pressure_gate_blocks_periodic_shrink() {
        let allocator = Arc::new(HeapAllocator::new());
        let pressure = Arc::new(PressureEpoch::new());
        let segment = BufferSegment::new(
            SegmentLayout {
                index: 0,
                buffer_size: 64,
                buffers_per_generation: 1,
                max_generations: 4,
            },
            allocator,
            pressure.clone(),
            u64::MAX,
            true,
        );
        let a = segment.acquire(false).expect("ok").expect("第 0 代");
        let b = segment.acquire(false).expect("ok").expect("第 1 代");
        segment.release(a);
        segment.release(b);
        for _ in 0..4 {
            assert_eq!(segment.evaluate(false), None, "无压力信号时周期性评估不得收缩");
        }
        pressure.bump();
        assert!(segment.evaluate(false).is_some(), "压力信号出现后允许收缩");
    }
}
