use core::fmt;

use bytes::BytesMut;

/// 缓冲的进程内唯一标识。
///
/// 追踪包装器以标识（而非内容相等）判断缓冲身份；池化缓冲在多次复用之间保持同一标识。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(u64);

impl BufferId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 返回底层数值。
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 缓冲所属的代。
///
/// - `Pooled(id)`：分配时分段正处于第 `id` 代，归还时据此判断是否仍在保留范围内；
/// - `Unpooled`：代空间耗尽后的临时缓冲，只允许有限次复用。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Generation {
    Pooled(u16),
    Unpooled,
}

/// 显式的 `{分段, 代}` 标签，与缓冲句柄并存而不编码进容量字段。
///
/// # 教案式说明
/// - **意图 (Why)**：归还路径需要在 O(1) 时间内定位所属分段与代；
/// - **契约 (What)**：标签在缓冲生命周期内不可变，即使分段的目标代随后下降；
/// - **风险 (Trade-offs)**：每个句柄多占 4 字节，换取不依赖容量位技巧的清晰语义。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferTag {
    pub segment: u8,
    pub generation: Generation,
}

/// 固定容量的字节块。
///
/// # 设计概要（How）
/// - 底层 `BytesMut` 在分配时即以零填充，长度恒等于容量，因此任何字节都可被读取与校验；
/// - `position`/`limit` 构成可用窗口：写入从 `position` 开始，不得越过 `limit`；
/// - 缓冲不实现 `Clone`，同一时刻只能被一个持有者拥有，归还即转移所有权。
///
/// # 契约说明（What）
/// - 丢弃而不归还不会造成内存不安全，但会让分段的在用计数失真，这正是
///   [`CheckedBufferManager`](crate::CheckedBufferManager) 要捕获的泄漏。
pub struct Buffer {
    id: BufferId,
    tag: BufferTag,
    data: BytesMut,
    position: usize,
    limit: usize,
    reuses: u32,
}

impl Buffer {
    pub(crate) fn new(id: BufferId, tag: BufferTag, data: BytesMut) -> Self {
        let limit = data.len();
        Self {
            id,
            tag,
            data,
            position: 0,
            limit,
            reuses: 0,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn tag(&self) -> BufferTag {
        self.tag
    }

    /// 缓冲总容量。
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// 已写入的字节数。
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// 窗口内仍可写入的字节数。
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// 调整写入位置，超过 `limit` 时截断到 `limit`。
    pub fn set_position(&mut self, position: usize) {
        self.position = position.min(self.limit);
    }

    /// 调整窗口上限，超过容量时截断到容量；`position` 随之收敛。
    pub fn set_limit(&mut self, limit: usize) {
        self.limit = limit.min(self.capacity());
        self.position = self.position.min(self.limit);
    }

    /// 将 `src` 写入窗口，返回实际写入的字节数。
    pub fn put_slice(&mut self, src: &[u8]) -> usize {
        let count = src.len().min(self.remaining());
        let start = self.position;
        self.data[start..start + count].copy_from_slice(&src[..count]);
        self.position += count;
        count
    }

    /// 已写入区域 `[0, position)` 的只读视图。
    pub fn written(&self) -> &[u8] {
        &self.data[..self.position]
    }

    /// 整个容量的只读视图。
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// 整个容量的可写视图，不改变 `position`。
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// 重置窗口为 `[0, capacity)`，内容保持不变。
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity();
    }

    /// 将全部内容清零。
    pub fn zero(&mut self) {
        self.data.fill(0);
    }

    /// 全部字节是否均为零。
    pub fn is_zeroed(&self) -> bool {
        self.data.iter().all(|byte| *byte == 0)
    }

    /// 记录一次非池化复用并返回累计次数。
    pub(crate) fn note_reuse(&mut self) -> u32 {
        self.reuses = self.reuses.saturating_add(1);
        self.reuses
    }

    pub(crate) fn into_bytes(self) -> BytesMut {
        self.data
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("capacity", &self.capacity())
            .field("position", &self.position)
            .field("limit", &self.limit)
            .finish()
    }
}
