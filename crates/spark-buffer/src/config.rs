//! 缓冲管理器配置。
//!
//! # 模块定位（Why）
//! - 分段布局（尺寸级别、每代缓冲数、代上限）在构造期一次性推导并校验，运行期不再改变；
//! - 配置支持 `serde` 反序列化，宿主可以直接从 TOML 片段加载。
//!
//! # 校验规则（What）
//! - `min_buffer_size` 向上取整到 [`SIZE_GRANULARITY`]，为 0 视为非法；
//! - `growth_factor` 至少为 1，`segment_count` 位于 `1..=64`；
//! - 最大分段尺寸不得溢出，且不得超过单个分段的池预算，否则说明增长因子过于激进。

use serde::{Deserialize, Serialize};

use crate::{error::BufferError, segment::MAX_POOLED_GENERATIONS};

/// 尺寸级别的最小粒度，小于粒度的尺寸向上取整。
pub const SIZE_GRANULARITY: usize = 16;

/// 默认每累计多少次归还触发一次收缩评估。
pub const STATS_FREQUENCY: u64 = 1024;

const MAX_SEGMENTS: usize = 64;

/// [`SegmentedBufferManager`](crate::SegmentedBufferManager) 的构造参数。
///
/// # 教案式说明
/// - **意图 (Why)**：用少量参数描述整组几何递增的尺寸级别与内存预算；
/// - **契约 (What)**：
///   - `min_buffer_size`：第 0 个分段的缓冲尺寸；
///   - `segment_count`：分段数量，第 `i` 段尺寸为 `min << (i * growth_factor)`；
///   - `growth_factor`：相邻分段尺寸的位移量，1 表示逐段翻倍；
///   - `max_pool_bytes`：全部分段可保留的池化字节总预算，平均分给每个分段；
///   - `stats_frequency`：每累计多少次归还触发一次收缩评估；
///   - `shrink_requires_pressure`：为 `true` 时，周期性收缩仅在自上次扩容以来出现过内存压力信号时进行。
/// - **风险 (Trade-offs)**：预算均分意味着大尺寸分段每代缓冲数更少，极端负载下更早退化为非池化分配。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentedBufferConfig {
    pub min_buffer_size: usize,
    pub segment_count: usize,
    pub growth_factor: u32,
    pub max_pool_bytes: usize,
    pub stats_frequency: u64,
    pub shrink_requires_pressure: bool,
}

impl Default for SegmentedBufferConfig {
    fn default() -> Self {
        Self {
            min_buffer_size: 1024,
            segment_count: 7,
            growth_factor: 1,
            max_pool_bytes: 64 * 1024 * 1024,
            stats_frequency: STATS_FREQUENCY,
            shrink_requires_pressure: false,
        }
    }
}

impl SegmentedBufferConfig {
    /// 从 TOML 文本加载配置，缺省字段取默认值。
    pub fn from_toml_str(source: &str) -> Result<Self, BufferError> {
        let config: Self = toml::from_str(source)
            .map_err(|err| BufferError::invalid_config(format!("malformed toml: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    /// 校验配置并确认可以推导出合法的分段布局。
    pub fn validate(&self) -> Result<(), BufferError> {
        self.segment_layouts().map(|_| ())
    }

    /// 推导每个分段的布局。
    ///
    /// # 执行步骤（How）
    /// 1. 对最小尺寸按粒度取整；
    /// 2. 逐段以 `checked_shl` 计算尺寸，溢出即判定增长因子过大；
    /// 3. 每代缓冲数取 `ceil(预算 / (尺寸 * 代上限))`，保证代数不会超出标签可表达的范围；
    /// 4. 分段实际可用的代数为 `预算 / (尺寸 * 每代缓冲数)`，至少为 1。
    pub(crate) fn segment_layouts(&self) -> Result<Vec<SegmentLayout>, BufferError> {
        if self.min_buffer_size == 0 {
            return Err(BufferError::invalid_config("min_buffer_size must be positive"));
        }
        if self.segment_count == 0 || self.segment_count > MAX_SEGMENTS {
            return Err(BufferError::invalid_config(format!(
                "segment_count must be within 1..={MAX_SEGMENTS}, got {}",
                self.segment_count
            )));
        }
        if self.growth_factor == 0 {
            return Err(BufferError::invalid_config("growth_factor must be at least 1"));
        }
        if self.stats_frequency == 0 {
            return Err(BufferError::invalid_config("stats_frequency must be positive"));
        }

        let min = self
            .min_buffer_size
            .div_ceil(SIZE_GRANULARITY)
            .checked_mul(SIZE_GRANULARITY)
            .ok_or_else(|| BufferError::invalid_config("min_buffer_size overflows"))?;
        let budget = self.max_pool_bytes / self.segment_count;

        let mut layouts = Vec::with_capacity(self.segment_count);
        for index in 0..self.segment_count {
            let shift = (index as u32)
                .checked_mul(self.growth_factor)
                .filter(|shift| *shift < usize::BITS)
                .ok_or_else(|| {
                    BufferError::invalid_config(format!(
                        "growth_factor {} is too aggressive for {} segments",
                        self.growth_factor, self.segment_count
                    ))
                })?;
            let buffer_size = min
                .checked_shl(shift)
                .filter(|size| *size >> shift == min)
                .ok_or_else(|| {
                    BufferError::invalid_config(format!(
                        "segment {index} size overflows with growth_factor {}",
                        self.growth_factor
                    ))
                })?;
            if buffer_size > budget {
                return Err(BufferError::invalid_config(format!(
                    "segment {index} buffer size {buffer_size} exceeds the per-segment pool budget \
                     {budget}; lower growth_factor or raise max_pool_bytes"
                )));
            }

            let per_generation_floor = buffer_size.saturating_mul(usize::from(MAX_POOLED_GENERATIONS));
            let buffers_per_generation = budget.div_ceil(per_generation_floor).max(1);
            let max_generations = (budget / (buffer_size * buffers_per_generation))
                .clamp(1, usize::from(MAX_POOLED_GENERATIONS)) as u16;

            layouts.push(SegmentLayout {
                index: index as u8,
                buffer_size,
                buffers_per_generation,
                max_generations,
            });
        }
        Ok(layouts)
    }
}

/// 单个分段的布局。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentLayout {
    pub index: u8,
    pub buffer_size: usize,
    pub buffers_per_generation: usize,
    pub max_generations: u16,
}

/// [`CheckedBufferManager`](crate::CheckedBufferManager) 的诊断参数。
///
/// - `zero_on_release`：归还前清零，并要求新租出的缓冲内容全零；
/// - `warning_threshold_bytes`：在用字节相对窗口低水位增长超过该值时告警，0 表示关闭；
/// - `capture_backtraces`：是否在租借时捕获完整调用栈（代价高，仅用于排障）；
/// - `log_suspects_on_warning`：告警时是否附带输出泄漏嫌疑列表。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckedBufferConfig {
    pub zero_on_release: bool,
    pub warning_threshold_bytes: usize,
    pub capture_backtraces: bool,
    pub log_suspects_on_warning: bool,
}

impl Default for CheckedBufferConfig {
    fn default() -> Self {
        Self {
            zero_on_release: true,
            warning_threshold_bytes: 256 * 1024 * 1024,
            capture_backtraces: false,
            log_suspects_on_warning: true,
        }
    }
}

impl CheckedBufferConfig {
    pub fn from_toml_str(source: &str) -> Result<Self, BufferError> {
        toml::from_str(source)
            .map_err(|err| BufferError::invalid_config(format!("malformed toml: {err}")))
    }
}
