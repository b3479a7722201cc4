use core::fmt;

/// 分区编号，取值范围 `0..partition_count`。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(u32);

impl PartitionId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// 固定分区数下的分区位图。
///
/// # 教案式说明
/// - **意图 (Why)**：多分区请求用它表达“请求的分区 / 已答复的分区 / 被拒绝的分区 / 答复掩码”，
///   逐位清除即可判断轮询是否已被满足；
/// - **契约 (What)**：两个集合只有在分区总数一致时才能做集合运算，越界分区在插入时被忽略；
/// - **风险 (Trade-offs)**：位图大小与分区总数成正比，分区数在数千以内时开销可以忽略。
#[derive(Clone, PartialEq, Eq, Default)]
pub struct PartitionSet {
    partition_count: u32,
    bits: Vec<u64>,
}

impl PartitionSet {
    /// 空集合。
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count,
            bits: vec![0; (partition_count as usize).div_ceil(64)],
        }
    }

    /// 包含全部分区的集合。
    pub fn full(partition_count: u32) -> Self {
        let mut set = Self::new(partition_count);
        for partition in 0..partition_count {
            set.add(PartitionId(partition));
        }
        set
    }

    pub fn from_partitions(
        partition_count: u32,
        partitions: impl IntoIterator<Item = PartitionId>,
    ) -> Self {
        let mut set = Self::new(partition_count);
        for partition in partitions {
            set.add(partition);
        }
        set
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// 加入分区，返回此前是否不存在；越界分区被忽略并返回 `false`。
    pub fn add(&mut self, partition: PartitionId) -> bool {
        if partition.0 >= self.partition_count {
            return false;
        }
        let (word, mask) = Self::locate(partition);
        let absent = self.bits[word] & mask == 0;
        self.bits[word] |= mask;
        absent
    }

    pub fn remove(&mut self, partition: PartitionId) -> bool {
        if partition.0 >= self.partition_count {
            return false;
        }
        let (word, mask) = Self::locate(partition);
        let present = self.bits[word] & mask != 0;
        self.bits[word] &= !mask;
        present
    }

    pub fn contains(&self, partition: PartitionId) -> bool {
        if partition.0 >= self.partition_count {
            return false;
        }
        let (word, mask) = Self::locate(partition);
        self.bits[word] & mask != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|word| *word == 0)
    }

    pub fn cardinality(&self) -> usize {
        self.bits.iter().map(|word| word.count_ones() as usize).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
        (0..self.partition_count)
            .map(PartitionId)
            .filter(|partition| self.contains(*partition))
    }

    /// 并入 `other` 的全部分区。
    pub fn add_all(&mut self, other: &PartitionSet) {
        for (word, theirs) in self.bits.iter_mut().zip(&other.bits) {
            *word |= *theirs;
        }
    }

    /// 移除 `other` 中的全部分区。
    pub fn remove_all(&mut self, other: &PartitionSet) {
        for (word, theirs) in self.bits.iter_mut().zip(&other.bits) {
            *word &= !*theirs;
        }
    }

    /// 只保留同时属于 `other` 的分区。
    pub fn retain_all(&mut self, other: &PartitionSet) {
        for (index, word) in self.bits.iter_mut().enumerate() {
            *word &= other.bits.get(index).copied().unwrap_or(0);
        }
    }

    pub fn intersects(&self, other: &PartitionSet) -> bool {
        self.bits
            .iter()
            .zip(&other.bits)
            .any(|(ours, theirs)| ours & theirs != 0)
    }

    /// 两个集合的并集。
    pub fn union(&self, other: &PartitionSet) -> PartitionSet {
        let mut merged = self.clone();
        merged.add_all(other);
        merged
    }

    fn locate(partition: PartitionId) -> (usize, u64) {
        ((partition.0 / 64) as usize, 1u64 << (partition.0 % 64))
    }
}

impl fmt::Debug for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|p| p.0)).finish()
    }
}

impl fmt::Display for PartitionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PartitionSet{{")?;
        for (index, partition) in self.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", partition.0)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_algebra_across_word_boundary() {
        let mut requested = PartitionSet::full(130);
        assert_eq!(requested.cardinality(), 130);

        let answered = PartitionSet::from_partitions(130, (0..70).map(PartitionId::new));
        let rejected = PartitionSet::from_partitions(130, [PartitionId::new(129)]);
        requested.remove_all(&answered);
        requested.remove_all(&rejected);
        assert_eq!(requested.cardinality(), 59);
        assert!(!requested.contains(PartitionId::new(69)));
        assert!(requested.contains(PartitionId::new(70)));
        assert!(!requested.intersects(&answered));
        assert_eq!(requested.union(&rejected).cardinality(), 60);
    }

    #[test]
    fn out_of_range_partition_is_ignored() {
        let mut set = PartitionSet::new(8);
        assert!(!set.add(PartitionId::new(8)));
        assert!(set.is_empty());
        assert_eq!(format!("{set}"), "PartitionSet{}");
        set.add(PartitionId::new(3));
        set.add(PartitionId::new(5));
        assert_eq!(format!("{set}"), "PartitionSet{3, 5}");
    }
}
