use core::fmt;
use std::collections::BTreeSet;

/// 集群成员标识。
///
/// 标识按加入顺序单调分配，因此数值最小的存活成员即为最老成员；线格式中以 4 字节有符号整数承载。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberId(u32);

impl MemberId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Member({})", self.0)
    }
}

/// 有序成员集合。
///
/// # 教案式说明
/// - **意图 (Why)**：轮询需要记录“待响应 / 已响应 / 已离开”三组成员，成员视图查询也返回同一类型；
/// - **契约 (What)**：按标识升序迭代，`first` 即最老成员；
/// - **风险 (Trade-offs)**：`BTreeSet` 在成员数较少时足够高效，集群规模上千时可替换为位图。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MemberSet(BTreeSet<MemberId>);

impl MemberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, member: MemberId) -> bool {
        self.0.insert(member)
    }

    pub fn remove(&mut self, member: MemberId) -> bool {
        self.0.remove(&member)
    }

    pub fn contains(&self, member: MemberId) -> bool {
        self.0.contains(&member)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// 标识最小的成员。
    pub fn first(&self) -> Option<MemberId> {
        self.0.first().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = MemberId> + '_ {
        self.0.iter().copied()
    }

    /// 环形顺序中 `member` 之后的第一个成员（不含自身）；集合中没有其他成员时返回 `None`。
    pub fn successor_of(&self, member: MemberId) -> Option<MemberId> {
        self.0
            .range(MemberId(member.0.saturating_add(1))..)
            .next()
            .or_else(|| self.0.iter().next())
            .copied()
            .filter(|next| *next != member)
    }

    /// 移出集合中的全部成员并返回。
    pub fn take_all(&mut self) -> MemberSet {
        MemberSet(std::mem::take(&mut self.0))
    }
}

impl FromIterator<MemberId> for MemberSet {
    fn from_iter<I: IntoIterator<Item = MemberId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<MemberId> for MemberSet {
    fn extend<I: IntoIterator<Item = MemberId>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[u32]) -> MemberSet {
        ids.iter().copied().map(MemberId::new).collect()
    }

    #[test]
    fn successor_wraps_around_ring() {
        let members = set(&[1, 4, 7]);
        assert_eq!(members.successor_of(MemberId::new(1)), Some(MemberId::new(4)));
        assert_eq!(members.successor_of(MemberId::new(7)), Some(MemberId::new(1)));
        assert_eq!(members.successor_of(MemberId::new(5)), Some(MemberId::new(7)), "不在集合中的成员同样可以求后继");
        assert_eq!(set(&[3]).successor_of(MemberId::new(3)), None);
    }
}
