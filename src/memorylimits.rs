use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::ops::{Index, IndexMut};

use crate::target::{MemoryLevel, LEVEL_COUNT};
use crate::utils::join_into_string;

/// Bytes per [MemoryLevel], indexed in declaration order.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Deserialize, Serialize)]
pub struct MemVec(SmallVec<[u64; LEVEL_COUNT]>);

impl MemVec {
    pub fn new(contents: SmallVec<[u64; LEVEL_COUNT]>) -> Self {
        assert_eq!(contents.len(), LEVEL_COUNT);
        MemVec(contents)
    }

    pub fn zero() -> Self {
        MemVec(SmallVec::from_elem(0, LEVEL_COUNT))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &u64> {
        self.0.iter()
    }

    /// Levels paired with their byte counts.
    pub fn levels(&self) -> impl Iterator<Item = (MemoryLevel, u64)> + '_ {
        enum_iterator::all::<MemoryLevel>().map(move |l| (l, self[l]))
    }

    /// The first level at which `self` exceeds `capacity`, if any.
    pub fn first_overflow(&self, capacity: &MemVec) -> Option<MemoryLevel> {
        self.levels()
            .find(|&(level, used)| used > capacity[level])
            .map(|(level, _)| level)
    }

    pub fn fits(&self, capacity: &MemVec) -> bool {
        self.first_overflow(capacity).is_none()
    }
}

impl Index<MemoryLevel> for MemVec {
    type Output = u64;

    fn index(&self, level: MemoryLevel) -> &Self::Output {
        &self.0[level.index()]
    }
}

impl IndexMut<MemoryLevel> for MemVec {
    fn index_mut(&mut self, level: MemoryLevel) -> &mut Self::Output {
        &mut self.0[level.index()]
    }
}

impl FromIterator<u64> for MemVec {
    fn from_iter<T: IntoIterator<Item = u64>>(iter: T) -> Self {
        MemVec(iter.into_iter().collect())
    }
}

impl fmt::Display for MemVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}]",
            join_into_string(self.levels().map(|(l, v)| format!("{l}: {v}")), ", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    #[test]
    fn test_first_overflow_reports_earliest_level() {
        let capacity = MemVec::new(smallvec![10, 10, 10, 10, 10, 10]);
        let mut used = MemVec::zero();
        assert!(used.fits(&capacity));
        used[MemoryLevel::L1] = 11;
        used[MemoryLevel::BT] = 11;
        assert_eq!(used.first_overflow(&capacity), Some(MemoryLevel::L1));
    }

    #[test]
    fn test_exact_capacity_fits() {
        let capacity = MemVec::new(smallvec![1, 2, 3, 4, 5, 6]);
        assert!(capacity.clone().fits(&capacity));
    }
}
