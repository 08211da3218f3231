use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use smallvec::smallvec;
use std::fmt::{self, Debug, Display};

use crate::common::{DimSize, C0_BYTES};
use crate::memorylimits::MemVec;

pub const LEVEL_COUNT: usize = 6;

/// On-chip buffers whose capacity bounds a tiling.
#[derive(
    Eq,
    PartialEq,
    Debug,
    Copy,
    Clone,
    Hash,
    Ord,
    PartialOrd,
    Deserialize,
    Serialize,
    enum_iterator::Sequence,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum MemoryLevel {
    L0A,
    L0B,
    L0C,
    L1,
    UB,
    BT,
}

impl MemoryLevel {
    pub fn index(self) -> usize {
        match self {
            MemoryLevel::L0A => 0,
            MemoryLevel::L0B => 1,
            MemoryLevel::L0C => 2,
            MemoryLevel::L1 => 3,
            MemoryLevel::UB => 4,
            MemoryLevel::BT => 5,
        }
    }

    pub fn levels() -> Vec<MemoryLevel> {
        enum_iterator::all::<MemoryLevel>().collect()
    }
}

impl Display for MemoryLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                MemoryLevel::L0A => "L0A",
                MemoryLevel::L0B => "L0B",
                MemoryLevel::L0C => "L0C",
                MemoryLevel::L1 => "L1",
                MemoryLevel::UB => "UB",
                MemoryLevel::BT => "BT",
            }
        )
    }
}

#[derive(
    Clone, Copy, Hash, Eq, PartialEq, Debug, Serialize, Deserialize, clap::ValueEnum,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum TargetId {
    /// Training part: 32 cube cores, 64 vector cores.
    Cube32,
    /// Training part: 24 cube cores, 48 vector cores.
    Cube24,
    /// Inference part with a small accumulator buffer.
    Cube8,
    Edge2,
}

impl TargetId {
    pub fn name(&self) -> &'static str {
        match self {
            TargetId::Cube32 => "cube32",
            TargetId::Cube24 => "cube24",
            TargetId::Cube8 => "cube8",
            TargetId::Edge2 => "edge2",
        }
    }
}

impl Display for TargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Per-instruction operand limits of the load/compute/store primitives.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrLimits {
    /// Largest element count along a free dimension of one instruction.
    pub max_free_dim: DimSize,
    pub max_pad: DimSize,
    pub max_kernel: DimSize,
    pub max_stride: DimSize,
    pub max_dilation: DimSize,
    pub max_groups: DimSize,
    /// Largest declared extent of any tensor axis.
    pub max_extent: DimSize,
    /// Widest input row the M-mode image-to-column load accepts.
    pub max_load3d_wi: DimSize,
    /// Source stride field of the channel-last activation load.
    pub max_load3d_src_stride: u64,
    /// Destination stride field of the channel-last output store.
    pub max_fixpipe_stride: u64,
}

impl Default for InstrLimits {
    fn default() -> Self {
        InstrLimits {
            max_free_dim: 65535,
            max_pad: 255,
            max_kernel: 511,
            max_stride: 63,
            max_dilation: 255,
            max_groups: 65535,
            max_extent: i32::MAX as DimSize,
            max_load3d_wi: 32767,
            max_load3d_src_stride: (1 << 40) - 1,
            max_fixpipe_stride: u32::MAX as u64,
        }
    }
}

/// Capacity descriptor of one accelerator target.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlatformBudget {
    pub target: TargetId,
    pub cube_cores: u32,
    pub vector_cores: u32,
    /// Bytes available per [MemoryLevel].
    pub capacity: MemVec,
    /// Alignment granularity of every cube-side buffer, in bytes.
    pub c0_bytes: u64,
    pub limits: InstrLimits,
}

lazy_static! {
    static ref CATALOG: Vec<PlatformBudget> = vec![
        PlatformBudget {
            target: TargetId::Cube32,
            cube_cores: 32,
            vector_cores: 64,
            capacity: MemVec::new(smallvec![65536, 65536, 131072, 524288, 196608, 1024]),
            c0_bytes: C0_BYTES,
            limits: InstrLimits::default(),
        },
        PlatformBudget {
            target: TargetId::Cube24,
            cube_cores: 24,
            vector_cores: 48,
            capacity: MemVec::new(smallvec![65536, 65536, 131072, 524288, 196608, 1024]),
            c0_bytes: C0_BYTES,
            limits: InstrLimits::default(),
        },
        PlatformBudget {
            target: TargetId::Cube8,
            cube_cores: 8,
            vector_cores: 8,
            capacity: MemVec::new(smallvec![65536, 65536, 65536, 1048576, 262144, 1024]),
            c0_bytes: C0_BYTES,
            limits: InstrLimits::default(),
        },
        PlatformBudget {
            target: TargetId::Edge2,
            cube_cores: 2,
            vector_cores: 2,
            capacity: MemVec::new(smallvec![32768, 32768, 65536, 262144, 131072, 1024]),
            c0_bytes: C0_BYTES,
            limits: InstrLimits::default(),
        },
    ];
}

impl PlatformBudget {
    /// The process-wide catalog of known targets.
    pub fn catalog() -> &'static [PlatformBudget] {
        &CATALOG
    }

    pub fn for_target(target: TargetId) -> &'static PlatformBudget {
        // Catalog entries are listed in TargetId declaration order.
        &CATALOG[target as usize]
    }

    pub fn capacity_of(&self, level: MemoryLevel) -> u64 {
        self.capacity[level]
    }

    pub fn core_count(&self) -> u64 {
        self.cube_cores.into()
    }

    /// Returns a copy with one level's capacity replaced.
    pub fn with_capacity(mut self, level: MemoryLevel, bytes: u64) -> Self {
        self.capacity[level] = bytes;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_target_has_catalog_entry() {
        for budget in PlatformBudget::catalog() {
            assert_eq!(PlatformBudget::for_target(budget.target), budget);
        }
        assert_eq!(PlatformBudget::catalog().len(), 4);
    }

    #[test]
    fn test_levels_enumerate_in_index_order() {
        for (i, level) in MemoryLevel::levels().into_iter().enumerate() {
            assert_eq!(level.index(), i);
        }
        assert_eq!(MemoryLevel::levels().len(), LEVEL_COUNT);
    }

    #[test]
    fn test_with_capacity_only_touches_one_level() {
        let base = PlatformBudget::for_target(TargetId::Cube32).clone();
        let small = base.clone().with_capacity(MemoryLevel::L1, 4096);
        assert_eq!(small.capacity_of(MemoryLevel::L1), 4096);
        assert_eq!(small.capacity_of(MemoryLevel::L0A), base.capacity_of(MemoryLevel::L0A));
    }
}
