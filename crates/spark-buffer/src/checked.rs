//! # CheckedBufferManager：缓冲正确性诊断包装器
//!
//! ## 核心意图（Why）
//! - 在不改动调用方的前提下替换真实管理器，验证“每个缓冲只被一个持有者拥有”的契约；
//! - 把重复释放、释放外来缓冲视为编程错误：记录 `error!` 日志并返回错误，绝不静默吞掉；
//! - 记录每个在外缓冲的租借位置，按位置聚合后输出泄漏嫌疑列表。
//!
//! ## 契约（What）
//! - 租借家族方法反复调用被包装的管理器，直到拿到内容全零（若开启清零）且未被追踪的缓冲；
//! - 在外字节相对窗口低水位增长超过阈值时告警，随后重置窗口；
//! - 追踪表由 `parking_lot::Mutex` 保护，包装器本身不适合生产热路径。

use std::{backtrace::Backtrace, collections::HashMap, fmt, panic::Location};

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::{
    buffer::{Buffer, BufferId},
    config::CheckedBufferConfig,
    error::BufferError,
    manager::{BufferManager, TRUNCATE_RATIO},
    stats::PoolStats,
};

/// 单次租借的最大尝试次数，超过后判定被包装的管理器已无法提供干净的缓冲。
pub const MAX_ACQUIRE_ATTEMPTS: usize = 1024;

/// 缓冲的租借位置。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AcquisitionSite(&'static Location<'static>);

impl AcquisitionSite {
    pub fn file(&self) -> &'static str {
        self.0.file()
    }

    pub fn line(&self) -> u32 {
        self.0.line()
    }
}

impl fmt::Display for AcquisitionSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.0.file(), self.0.line(), self.0.column())
    }
}

/// 一个在外缓冲的快照。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutstandingBuffer {
    pub id: BufferId,
    pub size: usize,
    pub site: AcquisitionSite,
}

/// 泄漏嫌疑：同一租借位置上累计保留的缓冲。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeakSuspect {
    pub site: AcquisitionSite,
    pub occurrences: usize,
    pub retained_bytes: usize,
    /// 开启 `capture_backtraces` 时附带其中一次租借的完整调用栈。
    pub sample_backtrace: Option<String>,
}

struct Tracked {
    size: usize,
    site: AcquisitionSite,
    backtrace: Option<String>,
}

#[derive(Default)]
struct Ledger {
    outstanding: HashMap<BufferId, Tracked>,
    outstanding_bytes: usize,
    low_water: usize,
    high_water: usize,
}

/// 缓冲正确性诊断包装器。
///
/// # 教案式说明
/// - **意图 (Why)**：被包装的管理器若因缺陷或绕过包装器的并发误用交出仍在使用的缓冲，
///   包装器必须拦截而不是让两个持有者共享同一块内存；
/// - **逻辑 (How)**：
///   - 租借时先捕获调用位置，再循环调用被包装的管理器；被拒绝的候选在循环结束前一直保留，
///     避免被包装的管理器按 LIFO 顺序反复交回同一个候选；
///   - 循环结束后，内容不为零的候选清零后归还，重复交出的候选直接丢弃并记录错误；
///   - 归还时先从追踪表移除，未被追踪则记录 `error!` 并返回 [`BufferError::UnknownBuffer`]；
/// - **契约 (What)**：`outstanding()` 恰等于“已交出减去已归还”的集合；
/// - **风险 (Trade-offs)**：每次租借都要扫描缓冲内容并获取全局锁，开销远高于被包装的管理器。
pub struct CheckedBufferManager<M: BufferManager> {
    delegate: M,
    config: CheckedBufferConfig,
    ledger: Mutex<Ledger>,
}

impl<M: BufferManager> CheckedBufferManager<M> {
    pub fn new(delegate: M, config: CheckedBufferConfig) -> Self {
        Self {
            delegate,
            config,
            ledger: Mutex::new(Ledger::default()),
        }
    }

    pub fn delegate(&self) -> &M {
        &self.delegate
    }

    pub fn config(&self) -> &CheckedBufferConfig {
        &self.config
    }

    #[track_caller]
    pub fn acquire(&self, min_size: usize) -> Result<Buffer, BufferError> {
        let site = AcquisitionSite(Location::caller());
        self.acquire_checked(site, min_size, |delegate| delegate.acquire(min_size))
    }

    #[track_caller]
    pub fn acquire_pref(&self, pref_size: usize) -> Result<Buffer, BufferError> {
        let site = AcquisitionSite(Location::caller());
        self.acquire_checked(site, pref_size, |delegate| delegate.acquire_pref(pref_size))
    }

    #[track_caller]
    pub fn acquire_sum(&self, sum_size: usize) -> Result<Buffer, BufferError> {
        let site = AcquisitionSite(Location::caller());
        self.acquire_checked(site, sum_size, |delegate| delegate.acquire_sum(sum_size))
    }

    /// 归还缓冲；未被追踪的缓冲视为重复释放或外来缓冲。
    pub fn release(&self, mut buffer: Buffer) -> Result<(), BufferError> {
        self.untrack(buffer.id())?;
        if self.config.zero_on_release {
            buffer.zero();
        }
        self.delegate.release(buffer)
    }

    /// 截断缓冲：已写字节不超过容量的 `1 / TRUNCATE_RATIO` 时搬迁到更小的缓冲。
    ///
    /// # 执行步骤（How）
    /// 1. 搬迁在包装器层完成：新缓冲走 [`Self::acquire_checked`] 的重复与清零校验；
    /// 2. 原缓冲经由包装器自身的 [`Self::release`] 归还，因此同样遵守 `zero_on_release`；
    /// 3. 新缓冲继承原租借位置与调用栈；租借失败或没有更小的缓冲时原样返回。
    pub fn truncate(&self, buffer: Buffer) -> Result<Buffer, BufferError> {
        let original = buffer.id();
        let Some((site, backtrace)) = self.origin_of(original) else {
            error!(buffer = %original, "truncate of a buffer that is not outstanding");
            return Err(BufferError::UnknownBuffer { id: original });
        };

        let used = buffer.position();
        if used.saturating_mul(TRUNCATE_RATIO) > buffer.capacity() {
            return Ok(buffer);
        }
        let target = used.max(1);
        let Ok(mut smaller) = self.acquire_checked(site, target, |delegate| delegate.acquire(target))
        else {
            return Ok(buffer);
        };
        self.inherit_backtrace(smaller.id(), backtrace);
        if smaller.capacity() >= buffer.capacity() {
            self.release(smaller)?;
            return Ok(buffer);
        }

        smaller.put_slice(buffer.written());
        self.release(buffer)?;
        Ok(smaller)
    }

    /// 当前在外字节数。
    pub fn outstanding_bytes(&self) -> usize {
        self.ledger.lock().outstanding_bytes
    }

    pub fn outstanding_count(&self) -> usize {
        self.ledger.lock().outstanding.len()
    }

    pub fn is_tracked(&self, id: BufferId) -> bool {
        self.ledger.lock().outstanding.contains_key(&id)
    }

    /// 全部在外缓冲的快照，按标识排序。
    pub fn outstanding(&self) -> Vec<OutstandingBuffer> {
        let ledger = self.ledger.lock();
        let mut snapshot: Vec<OutstandingBuffer> = ledger
            .outstanding
            .iter()
            .map(|(id, tracked)| OutstandingBuffer {
                id: *id,
                size: tracked.size,
                site: tracked.site,
            })
            .collect();
        snapshot.sort_by_key(|buffer| buffer.id);
        snapshot
    }

    /// 泄漏嫌疑列表。
    ///
    /// 按租借位置聚合在外缓冲，只保留累计字节超过 `threshold_bytes` 的位置，
    /// 先按累计字节降序，再按次数降序。
    pub fn get_suspects(&self, threshold_bytes: usize) -> Vec<LeakSuspect> {
        let ledger = self.ledger.lock();
        collect_suspects(&ledger, threshold_bytes)
    }

    fn acquire_checked(
        &self,
        site: AcquisitionSite,
        requested: usize,
        attempt: impl Fn(&M) -> Result<Buffer, BufferError>,
    ) -> Result<Buffer, BufferError> {
        let mut rejected: Vec<(Buffer, bool)> = Vec::new();
        let outcome = loop {
            if rejected.len() == MAX_ACQUIRE_ATTEMPTS {
                break Err(BufferError::OutOfMemory { requested });
            }
            let candidate = match attempt(&self.delegate) {
                Ok(candidate) => candidate,
                Err(err) => break Err(err),
            };
            let duplicate = self.is_tracked(candidate.id());
            let dirty = self.config.zero_on_release && !candidate.is_zeroed();
            if !duplicate && !dirty {
                break Ok(candidate);
            }
            rejected.push((candidate, duplicate));
        };

        if !rejected.is_empty() {
            warn!(
                %site,
                attempts = rejected.len() + 1,
                "delegate buffer manager required multiple acquire attempts"
            );
        }
        for (mut candidate, duplicate) in rejected {
            if duplicate {
                error!(buffer = %candidate.id(), "delegate handed out a buffer that is already outstanding");
                continue;
            }
            candidate.zero();
            if let Err(err) = self.delegate.release(candidate) {
                error!(error = %err, "failed to return a rejected buffer to the delegate");
            }
        }

        let buffer = outcome?;
        let backtrace = self
            .config
            .capture_backtraces
            .then(|| Backtrace::force_capture().to_string());
        self.track(
            buffer.id(),
            Tracked {
                size: buffer.capacity(),
                site,
                backtrace,
            },
        );
        Ok(buffer)
    }

    fn track(&self, id: BufferId, tracked: Tracked) {
        let mut ledger = self.ledger.lock();
        ledger.outstanding_bytes += tracked.size;
        ledger.high_water = ledger.high_water.max(ledger.outstanding_bytes);
        ledger.outstanding.insert(id, tracked);

        let threshold = self.config.warning_threshold_bytes;
        if threshold == 0 || ledger.outstanding_bytes - ledger.low_water < threshold {
            return;
        }
        warn!(
            outstanding_bytes = ledger.outstanding_bytes,
            low_water = ledger.low_water,
            high_water = ledger.high_water,
            threshold,
            "outstanding buffer bytes crossed the warning threshold"
        );
        if self.config.log_suspects_on_warning {
            for suspect in collect_suspects(&ledger, threshold / 2) {
                warn!(
                    site = %suspect.site,
                    occurrences = suspect.occurrences,
                    retained_bytes = suspect.retained_bytes,
                    "buffer leak suspect"
                );
            }
        }
        ledger.low_water = ledger.outstanding_bytes;
        ledger.high_water = ledger.outstanding_bytes;
    }

    fn origin_of(&self, id: BufferId) -> Option<(AcquisitionSite, Option<String>)> {
        let ledger = self.ledger.lock();
        ledger
            .outstanding
            .get(&id)
            .map(|tracked| (tracked.site, tracked.backtrace.clone()))
    }

    fn inherit_backtrace(&self, id: BufferId, backtrace: Option<String>) {
        if let Some(tracked) = self.ledger.lock().outstanding.get_mut(&id) {
            tracked.backtrace = backtrace;
        }
    }

    fn untrack(&self, id: BufferId) -> Result<Tracked, BufferError> {
        let mut ledger = self.ledger.lock();
        let Some(tracked) = ledger.outstanding.remove(&id) else {
            drop(ledger);
            error!(buffer = %id, "release of a buffer that is not outstanding");
            return Err(BufferError::UnknownBuffer { id });
        };
        ledger.outstanding_bytes = ledger.outstanding_bytes.saturating_sub(tracked.size);
        ledger.low_water = ledger.low_water.min(ledger.outstanding_bytes);
        Ok(tracked)
    }
}

fn collect_suspects(ledger: &Ledger, threshold_bytes: usize) -> Vec<LeakSuspect> {
    let mut by_site: HashMap<AcquisitionSite, LeakSuspect> = HashMap::new();
    for tracked in ledger.outstanding.values() {
        let entry = by_site.entry(tracked.site).or_insert_with(|| LeakSuspect {
            site: tracked.site,
            occurrences: 0,
            retained_bytes: 0,
            sample_backtrace: None,
        });
        entry.occurrences += 1;
        entry.retained_bytes += tracked.size;
        if entry.sample_backtrace.is_none() {
            entry.sample_backtrace.clone_from(&tracked.backtrace);
        }
    }
    let mut suspects: Vec<LeakSuspect> = by_site
        .into_values()
        .filter(|suspect| suspect.retained_bytes > threshold_bytes)
        .collect();
    suspects.sort_by(|a, b| {
        b.retained_bytes
            .cmp(&a.retained_bytes)
            .then(b.occurrences.cmp(&a.occurrences))
    });
    suspects
}

impl<M: BufferManager> BufferManager for CheckedBufferManager<M> {
    #[track_caller]
    fn acquire(&self, min_size: usize) -> Result<Buffer, BufferError> {
        CheckedBufferManager::acquire(self, min_size)
    }

    #[track_caller]
    fn acquire_pref(&self, pref_size: usize) -> Result<Buffer, BufferError> {
        CheckedBufferManager::acquire_pref(self, pref_size)
    }

    #[track_caller]
    fn acquire_sum(&self, sum_size: usize) -> Result<Buffer, BufferError> {
        CheckedBufferManager::acquire_sum(self, sum_size)
    }

    fn truncate(&self, buffer: Buffer) -> Result<Buffer, BufferError> {
        CheckedBufferManager::truncate(self, buffer)
    }

    fn release(&self, buffer: Buffer) -> Result<(), BufferError> {
        CheckedBufferManager::release(self, buffer)
    }

    fn maximum_capacity(&self) -> usize {
        self.delegate.maximum_capacity()
    }

    fn statistics(&self) -> PoolStats {
        self.delegate.statistics()
    }

    fn dispose(&self) {
        let leaked = self.outstanding_count();
        if leaked > 0 {
            warn!(leaked, "disposing buffer manager with outstanding buffers");
        }
        self.delegate.dispose();
    }
}
