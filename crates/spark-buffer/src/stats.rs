use serde::Serialize;

/// 单个分段的统计快照。
///
/// # 字段说明（What）
/// - `live_generations`：当前目标代数，即保留范围的上界（不含）；
/// - `high_water`：最近一个评估窗口内的在用缓冲峰值，每次收缩评估后折半；
/// - `resident_bytes`：由该分段分配且尚未交还分配器的字节数（池中 + 在用）；
/// - `available_bytes`：空闲栈中缓冲的字节数；
/// - `unpooled_allocations`：代空间耗尽后的临时分配次数。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SegmentStats {
    pub index: u8,
    pub buffer_size: usize,
    pub live_generations: u16,
    pub max_generations: u16,
    pub buffers_per_generation: usize,
    pub free_buffers: usize,
    pub outstanding: usize,
    pub high_water: usize,
    pub acquired: u64,
    pub released: u64,
    pub resident_bytes: usize,
    pub available_bytes: usize,
    pub unpooled_allocations: u64,
    pub failed_acquisitions: u64,
}

/// 整个管理器的聚合统计。
///
/// 聚合字段由各分段快照求和得到；快照之间不加全局锁，数值只保证最终一致。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub resident_bytes: usize,
    pub available_bytes: usize,
    pub active_leases: usize,
    pub failed_acquisitions: u64,
    pub segments: Vec<SegmentStats>,
}

impl PoolStats {
    pub(crate) fn from_segments(segments: Vec<SegmentStats>) -> Self {
        let mut stats = PoolStats {
            segments: Vec::with_capacity(segments.len()),
            ..PoolStats::default()
        };
        for segment in segments {
            stats.resident_bytes += segment.resident_bytes;
            stats.available_bytes += segment.available_bytes;
            stats.active_leases += segment.outstanding;
            stats.failed_acquisitions += segment.failed_acquisitions;
            stats.segments.push(segment);
        }
        stats
    }

    /// 按尺寸查找分段快照。
    pub fn segment_for_size(&self, buffer_size: usize) -> Option<&SegmentStats> {
        self.segments
            .iter()
            .find(|segment| segment.buffer_size == buffer_size)
    }
}
