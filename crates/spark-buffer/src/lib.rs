//! `spark-buffer` 提供分代分段式的固定尺寸字节缓冲池，以及用于排障的正确性诊断包装器。
//!
//! # 模块定位（Why）
//! - 网格节点在收发消息时频繁租借与归还字节缓冲，池化可以显著降低分配次数；
//! - 单一尺寸的池无法同时服务小报文与大批量写入，因此按几何递增的尺寸级别分段；
//! - 负载尖峰过后池必须能收缩，否则一次历史峰值会让常驻内存永久膨胀。
//!
//! # 设计概要（How）
//! - [`BufferSegment`] 管理单个尺寸级别：空闲栈 + 原子代计数 + `Idle/Growing/Shrinking` 尺寸锁；
//! - [`SegmentedBufferManager`] 持有分段数组，负责最佳匹配与邻居探测；
//! - [`CheckedBufferManager`] 以装饰器形式包裹任意 [`BufferManager`]，验证缓冲归属并输出泄漏嫌疑；
//! - [`BufferAllocator`] 抽象底层内存来源，默认实现 [`HeapAllocator`] 支持可选的字节上限。
//!
//! # 命名约定（Consistency）
//! - “代”（generation）指一次批量扩容分配出的一组缓冲，缓冲的代记录在显式标签 [`BufferTag`] 中；
//! - “非池化”（unpooled）缓冲在代空间耗尽时临时分配，只允许有限次复用。

mod allocator;
mod buffer;
mod checked;
mod config;
mod error;
mod manager;
mod segment;
mod stats;
mod sync;

pub use allocator::{BufferAllocator, HeapAllocator};
pub use buffer::{Buffer, BufferId, BufferTag, Generation};
pub use checked::{
    AcquisitionSite, CheckedBufferManager, LeakSuspect, MAX_ACQUIRE_ATTEMPTS, OutstandingBuffer,
};
pub use config::{CheckedBufferConfig, SIZE_GRANULARITY, STATS_FREQUENCY, SegmentLayout, SegmentedBufferConfig};
pub use error::BufferError;
pub use manager::{BufferManager, SegmentedBufferManager, TRUNCATE_RATIO};
pub use segment::{
    BufferSegment, GENERATION_ID_BITS, MAX_POOLED_GENERATIONS, ShrinkReport,
    UNPOOLED_RECLAIM_INTERVAL,
};
pub use stats::{PoolStats, SegmentStats};

/// 供 loom 模型直接构造分段使用。
#[cfg(any(loom, spark_loom))]
#[doc(hidden)]
pub mod loom_support {
    use std::sync::Arc;

    use crate::{
        allocator::BufferAllocator,
        config::SegmentLayout,
        segment::{BufferSegment, PressureEpoch},
    };

    pub fn segment(layout: SegmentLayout, allocator: Arc<dyn BufferAllocator>) -> BufferSegment {
        BufferSegment::new(
            layout,
            allocator,
            Arc::new(PressureEpoch::new()),
            u64::MAX,
            false,
        )
    }
}
