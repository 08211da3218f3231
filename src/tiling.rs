//! Tile shapes at L0 and L1 and the byte footprint they occupy per memory level.

use serde::{Deserialize, Serialize};
use smallvec::{smallvec, SmallVec};
use std::fmt;

use crate::blockdim::{BlockDimResult, SplitMode};
use crate::common::{CubeUnit, DimSize, Dims3, C0_BYTES};
use crate::memorylimits::MemVec;
use crate::shape::{ConvProblem, GroupMode};
use crate::target::{MemoryLevel, PlatformBudget};
use crate::utils::{align_up, ceil_div};

/// Bytes per accumulator element in L0C and BT.
const ACC_BYTES: u64 = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpatialTile {
    pub ho: DimSize,
    pub wo: DimSize,
}

impl SpatialTile {
    pub const fn new(ho: DimSize, wo: DimSize) -> Self {
        SpatialTile { ho, wo }
    }

    /// Output positions covered, i.e. the GEMM M extent of the tile.
    pub fn positions(&self) -> DimSize {
        self.ho * self.wo
    }
}

impl fmt::Display for SpatialTile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.ho, self.wo)
    }
}

/// How the weight is brought into L1 along K.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    enum_iterator::Sequence,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum LoadB1Condition {
    /// Whole kernel windows per channel block.
    Full,
    /// Four channels folded into the window; all of K at once.
    C04,
    /// One kernel row at a time.
    TilingHk,
    /// One kernel tap at a time.
    TilingHkWk,
}

impl LoadB1Condition {
    pub fn code(&self) -> u8 {
        match self {
            LoadB1Condition::Full => 0,
            LoadB1Condition::C04 => 1,
            LoadB1Condition::TilingHk => 2,
            LoadB1Condition::TilingHkWk => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LoadB1Condition::Full),
            1 => Some(LoadB1Condition::C04),
            2 => Some(LoadB1Condition::TilingHk),
            3 => Some(LoadB1Condition::TilingHkWk),
            _ => None,
        }
    }

    /// K elements of one weight load unit.
    pub fn weight_unit(&self, core: &CoreShape) -> DimSize {
        match self {
            LoadB1Condition::Full => core.k_window,
            LoadB1Condition::C04 => core.k_total,
            LoadB1Condition::TilingHk => core.kernel.w * core.cube.k0,
            LoadB1Condition::TilingHkWk => core.cube.k0,
        }
    }
}

impl fmt::Display for LoadB1Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadB1Condition::Full => write!(f, "full"),
            LoadB1Condition::C04 => write!(f, "c04"),
            LoadB1Condition::TilingHk => write!(f, "tiling-hk"),
            LoadB1Condition::TilingHkWk => write!(f, "tiling-hkwk"),
        }
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Deserialize,
    Serialize,
    enum_iterator::Sequence,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum IterOrder {
    /// N tiles outermost, M tiles stream underneath.
    MFirst,
    /// M tiles outermost, N tiles stream underneath.
    NFirst,
    /// A single M and N tile; only K iterates.
    KFirst,
}

impl IterOrder {
    pub fn code(&self) -> u8 {
        match self {
            IterOrder::MFirst => 0,
            IterOrder::NFirst => 1,
            IterOrder::KFirst => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(IterOrder::MFirst),
            1 => Some(IterOrder::NFirst),
            2 => Some(IterOrder::KFirst),
            _ => None,
        }
    }
}

impl fmt::Display for IterOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IterOrder::MFirst => write!(f, "m-first"),
            IterOrder::NFirst => write!(f, "n-first"),
            IterOrder::KFirst => write!(f, "k-first"),
        }
    }
}

/// Buffer depths (1 or 2) of every double-bufferable buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PingPong {
    pub al0: u8,
    pub bl0: u8,
    pub cl0: u8,
    pub al1: u8,
    pub bl1: u8,
    pub ub: u8,
}

impl PingPong {
    pub const SINGLE: PingPong = PingPong {
        al0: 1,
        bl0: 1,
        cl0: 1,
        al1: 1,
        bl1: 1,
        ub: 1,
    };

    fn depths(&self) -> [u8; 6] {
        [self.al0, self.bl0, self.cl0, self.al1, self.bl1, self.ub]
    }

    /// Packs the depths into one bit per buffer, AL0 in the lowest bit and UB in bit 5.
    pub fn flag(&self) -> u8 {
        self.depths()
            .iter()
            .enumerate()
            .filter(|(_, &depth)| depth == 2)
            .fold(0, |acc, (i, _)| acc | (1 << i))
    }

    pub fn from_flag(flag: u8) -> Self {
        let depth = |bit: u8| if flag & (1 << bit) != 0 { 2 } else { 1 };
        PingPong {
            al0: depth(0),
            bl0: depth(1),
            cl0: depth(2),
            al1: depth(3),
            bl1: depth(4),
            ub: depth(5),
        }
    }

    fn is_valid(&self) -> bool {
        self.depths().iter().all(|d| *d == 1 || *d == 2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct L0Tile {
    pub spatial: SpatialTile,
    pub k: DimSize,
    pub n: DimSize,
}

impl L0Tile {
    pub fn minimal(core: &CoreShape) -> Self {
        L0Tile {
            spatial: core.min_spatial(),
            k: core.cube.k0,
            n: core.cube.n0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AL1Tile {
    pub spatial: SpatialTile,
    pub k: DimSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BL1Tile {
    pub k: DimSize,
    pub n: DimSize,
}

/// Extents of the last L1 tile along each axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tails {
    pub ho: DimSize,
    pub wo: DimSize,
    pub n: DimSize,
    pub k_al1: DimSize,
    pub k_bl1: DimSize,
}

/// The single-core slice of a problem that tile search works within.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreShape {
    pub mode: SplitMode,
    /// M mode: `(1, positions)`. HW mode: `(rows, wo)`.
    pub spatial: SpatialTile,
    /// Output channels, a multiple of `n0`.
    pub n: DimSize,
    pub k_total: DimSize,
    pub k_window: DimSize,
    pub kernel: Dims3,
    pub dilated: Dims3,
    pub stride: Dims3,
    pub out_h: DimSize,
    pub out_w: DimSize,
    pub in_h: DimSize,
    pub in_w: DimSize,
    pub cube: CubeUnit,
    pub fmap_bytes: u64,
    pub weight_bytes: u64,
    pub out_bytes: u64,
    pub bias_bytes: Option<u64>,
    pub c04: bool,
    /// Weight tiles pass through UB to be scattered block-diagonally.
    pub enlarged: bool,
    /// Batch, group, depth and phase passes one core makes over the tile loops.
    pub outer_iters: DimSize,
}

impl CoreShape {
    pub fn new(problem: &ConvProblem, block: &BlockDimResult) -> Self {
        let dims = &block.dims;
        let spatial = match block.mode {
            SplitMode::M => SpatialTile::new(1, dims.spatial.single),
            SplitMode::Hw => SpatialTile::new(dims.spatial.single, problem.output.w),
        };
        CoreShape {
            mode: block.mode,
            spatial,
            n: dims.n.single,
            k_total: problem.k_total(),
            k_window: problem.k_window(),
            kernel: problem.kernel,
            dilated: problem.dilated_kernel(),
            stride: problem.stride,
            out_h: problem.output.h,
            out_w: problem.output.w,
            in_h: problem.input.h,
            in_w: problem.input.w,
            cube: problem.cube(),
            fmap_bytes: problem.fmap_dtype.size(),
            weight_bytes: problem.weight_dtype.size(),
            out_bytes: problem.out_dtype.size(),
            bias_bytes: problem.bias_dtype.map(|d| d.size()),
            c04: problem.c04,
            enlarged: problem.group_mode == GroupMode::Enlarged,
            outer_iters: dims.batch.single
                * dims.group.single
                * dims.depth.single
                * problem.phases,
        }
    }

    /// The smallest legal spatial L0 tile.
    pub fn min_spatial(&self) -> SpatialTile {
        SpatialTile::new(1, self.cube.m0)
    }

    /// Weight load modes legal for this core, coarsest first.
    pub fn load_b1_modes(&self, allow_window_tiling: bool) -> SmallVec<[LoadB1Condition; 3]> {
        if self.c04 {
            smallvec![LoadB1Condition::C04]
        } else if self.enlarged || !allow_window_tiling {
            smallvec![LoadB1Condition::Full]
        } else {
            smallvec![
                LoadB1Condition::Full,
                LoadB1Condition::TilingHk,
                LoadB1Condition::TilingHkWk
            ]
        }
    }

    /// Whether `tile` spans the whole single-core spatial extent.
    pub fn spatial_covered_by(&self, tile: SpatialTile) -> bool {
        tile.ho >= self.spatial.ho && tile.wo >= self.spatial.wo
    }

    pub fn spatial_iters(&self, tile: SpatialTile) -> DimSize {
        ceil_div(self.spatial.ho, tile.ho) * ceil_div(self.spatial.wo, tile.wo)
    }

    /// L1 bytes of the activation rows needed to produce `tile` over `k` reduction elements.
    pub fn fmap_l1_bytes(&self, tile: SpatialTile, k: DimSize) -> u64 {
        let (out_rows, in_cols) = match self.mode {
            SplitMode::M => {
                let rows = ((tile.wo - 1) / self.out_w + 2).min(self.out_h);
                (rows, self.in_w)
            }
            SplitMode::Hw => {
                let cols = tile.wo.min(self.out_w);
                let in_cols = ((cols - 1) * self.stride.w + self.dilated.w).min(self.in_w);
                (tile.ho.min(self.spatial.ho), in_cols)
            }
        };
        let in_rows = ((out_rows - 1) * self.stride.h + self.dilated.h).min(self.in_h);
        let (planes, channel_bytes) = if self.c04 {
            (1, 4 * self.fmap_bytes)
        } else {
            (ceil_div(k, self.k_window), self.cube.k0 * self.fmap_bytes)
        };
        align_up(planes * in_rows * in_cols * channel_bytes, C0_BYTES)
    }

    pub fn weight_l1_bytes(&self, k: DimSize, n: DimSize) -> u64 {
        align_up(k * n * self.weight_bytes, C0_BYTES)
    }

    pub fn bias_l1_bytes(&self, n: DimSize) -> u64 {
        self.bias_bytes
            .map(|b| align_up(n * b, C0_BYTES))
            .unwrap_or(0)
    }

    /// The L1 footprint of the smallest tile set under `load_b1`.
    pub fn min_l1_bytes(&self, load_b1: LoadB1Condition) -> u64 {
        self.fmap_l1_bytes(self.min_spatial(), self.k_window)
            + self.weight_l1_bytes(load_b1.weight_unit(self), self.cube.n0)
            + self.bias_l1_bytes(self.cube.n0)
    }

    /// Footprint of the smallest L0 tiles, with every other level empty.
    pub fn min_l0_footprint(&self) -> MemVec {
        l0_footprint(self, &L0Tile::minimal(self), &PingPong::SINGLE)
    }
}

/// Bytes the L0 tiles occupy at L0A, L0B, L0C, UB and BT. L1 is left at zero.
pub fn l0_footprint(core: &CoreShape, l0: &L0Tile, pb: &PingPong) -> MemVec {
    let m = l0.spatial.positions();
    let mut used = MemVec::zero();
    used[MemoryLevel::L0A] = m * l0.k * core.fmap_bytes * u64::from(pb.al0);
    used[MemoryLevel::L0B] = l0.k * l0.n * core.weight_bytes * u64::from(pb.bl0);
    used[MemoryLevel::L0C] = m * l0.n * ACC_BYTES * u64::from(pb.cl0);
    used[MemoryLevel::UB] = if core.enlarged {
        l0.k * l0.n * core.weight_bytes * u64::from(pb.ub)
    } else {
        0
    };
    used[MemoryLevel::BT] = if core.bias_bytes.is_some() {
        l0.n * ACC_BYTES
    } else {
        0
    };
    used
}

/// A complete choice of tiles for one core.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileShape {
    pub mode: SplitMode,
    pub l0: L0Tile,
    pub al1: AL1Tile,
    pub bl1: BL1Tile,
    pub pingpong: PingPong,
    pub iter_order: IterOrder,
    pub al1_full_load: bool,
    pub bl1_full_load: bool,
    pub bias_full_load: bool,
    pub load_b1: LoadB1Condition,
    pub tails: Tails,
}

impl TileShape {
    /// Builds a tile shape, deriving the full-load flags and tails from `core`.
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        core: &CoreShape,
        l0: L0Tile,
        al1: AL1Tile,
        bl1: BL1Tile,
        pingpong: PingPong,
        iter_order: IterOrder,
        bias_full_load: bool,
        load_b1: LoadB1Condition,
    ) -> TileShape {
        let tail = |total: DimSize, tile: DimSize| total - (ceil_div(total, tile) - 1) * tile;
        TileShape {
            mode: core.mode,
            l0,
            al1,
            bl1,
            pingpong,
            iter_order,
            al1_full_load: core.spatial_covered_by(al1.spatial) && al1.k == core.k_total,
            bl1_full_load: bl1.n >= core.n && bl1.k == core.k_total,
            bias_full_load: bias_full_load && core.bias_bytes.is_some(),
            load_b1,
            tails: Tails {
                ho: tail(core.spatial.ho, al1.spatial.ho),
                wo: tail(core.spatial.wo, al1.spatial.wo),
                n: tail(core.n, bl1.n),
                k_al1: tail(core.k_total, al1.k),
                k_bl1: tail(core.k_total, bl1.k),
            },
        }
    }

    pub fn m_iters(&self, core: &CoreShape) -> DimSize {
        core.spatial_iters(self.al1.spatial)
    }

    pub fn n_iters(&self, core: &CoreShape) -> DimSize {
        ceil_div(core.n, self.bl1.n)
    }

    pub fn ka_iters(&self, core: &CoreShape) -> DimSize {
        ceil_div(core.k_total, self.al1.k)
    }

    pub fn kb_iters(&self, core: &CoreShape) -> DimSize {
        ceil_div(core.k_total, self.bl1.k)
    }

    /// L0 iterations over the whole single-core problem, per outer pass.
    pub fn l0_iters(&self, core: &CoreShape) -> DimSize {
        core.spatial_iters(self.l0.spatial)
            * ceil_div(core.n, self.l0.n)
            * ceil_div(core.k_total, self.l0.k)
    }

    /// Bytes live at every level, including alignment and buffer depths.
    pub fn footprint(&self, core: &CoreShape) -> MemVec {
        let pb = &self.pingpong;
        let bias_n = if self.bias_full_load {
            core.n
        } else {
            self.bl1.n
        };
        let mut used = l0_footprint(core, &self.l0, pb);
        used[MemoryLevel::L1] = core.fmap_l1_bytes(self.al1.spatial, self.al1.k)
            * u64::from(pb.al1)
            + core.weight_l1_bytes(self.bl1.k, self.bl1.n) * u64::from(pb.bl1)
            + core.bias_l1_bytes(bias_n);
        used
    }

    pub fn fits(&self, core: &CoreShape, budget: &PlatformBudget) -> bool {
        self.footprint(core).fits(&budget.capacity)
    }

    /// Checks the alignment and nesting rules every tile shape must obey.
    pub fn is_consistent(&self, core: &CoreShape) -> bool {
        let CubeUnit { m0, k0, n0 } = core.cube;
        let l0 = &self.l0;
        let aligned = l0.spatial.wo % m0 == 0
            && l0.spatial.ho >= 1
            && l0.k % k0 == 0
            && l0.n % n0 == 0
            && l0.k > 0
            && l0.n > 0;
        let row_shape = match core.mode {
            SplitMode::M => l0.spatial.ho == 1 && self.al1.spatial.ho == 1,
            SplitMode::Hw => l0.spatial.ho == 1 || l0.spatial.wo >= core.out_w,
        };
        let nested = self.al1.spatial.ho % l0.spatial.ho == 0
            && self.al1.spatial.wo % l0.spatial.wo == 0
            && self.al1.k % l0.k == 0
            && self.bl1.k % l0.k == 0
            && self.bl1.n % l0.n == 0;
        let k_split = self.al1.k % core.k_window == 0
            && core.k_total % self.al1.k == 0
            && core.k_total % self.bl1.k == 0
            && (self.al1.k % self.bl1.k == 0 || self.bl1.k % self.al1.k == 0)
            && self.bl1.k % self.load_b1.weight_unit(core) == 0;
        aligned && row_shape && nested && k_split && self.pingpong.is_valid()
    }
}

impl fmt::Display for TileShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "L0 {} k={} n={} | AL1 {} k={} | BL1 k={} n={} | pb={:06b} {} {}",
            self.l0.spatial,
            self.l0.k,
            self.l0.n,
            self.al1.spatial,
            self.al1.k,
            self.bl1.k,
            self.bl1.n,
            self.pingpong.flag(),
            self.iter_order,
            self.load_b1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ConvBuilder;
    use crate::target::TargetId;
    use crate::validate::validate;
    use proptest::prelude::*;

    fn core(builder: ConvBuilder, mode: SplitMode) -> CoreShape {
        let budget = PlatformBudget::for_target(TargetId::Cube32);
        let spec = validate(&builder.build(), &budget.limits).unwrap();
        let problem = spec.problem();
        CoreShape::new(&problem, &BlockDimResult::single_core(&problem, mode))
    }

    #[test]
    fn test_pingpong_flag_bit_order() {
        let pb = PingPong {
            al0: 2,
            ub: 2,
            ..PingPong::SINGLE
        };
        assert_eq!(pb.flag(), 0b100001);
        assert_eq!(PingPong::SINGLE.flag(), 0);
    }

    #[test]
    fn test_m_mode_fmap_rows_are_bounded_by_two_rows_plus_kernel() {
        let c = core(ConvBuilder::forward(1, 16, 16, [1, 34, 34], [1, 3, 3]), SplitMode::M);
        // 16 positions span at most 2 output rows, i.e. 4 input rows of 34.
        assert_eq!(c.fmap_l1_bytes(SpatialTile::new(1, 16), c.k_window), 4 * 34 * 32);
    }

    #[test]
    fn test_hw_mode_fmap_uses_tile_columns() {
        let c = core(ConvBuilder::forward(1, 16, 16, [1, 34, 34], [1, 3, 3]), SplitMode::Hw);
        assert_eq!(c.fmap_l1_bytes(SpatialTile::new(1, 16), c.k_window), 3 * 18 * 32);
    }

    #[test]
    fn test_c04_fmap_packs_four_channels() {
        let c = core(
            ConvBuilder::forward(1, 3, 16, [1, 16, 16], [1, 3, 3]).formats(
                crate::common::Format::Nc1hwc0,
                crate::common::Format::FractalZC04,
                crate::common::Format::Nc1hwc0,
            ),
            SplitMode::M,
        );
        assert!(c.c04);
        assert_eq!(c.k_total, 48);
        assert_eq!(
            c.load_b1_modes(true).into_vec(),
            vec![LoadB1Condition::C04]
        );
        // 16 positions of a 14-wide output touch 3 rows, i.e. 5 input rows of 4 channels.
        assert_eq!(c.fmap_l1_bytes(SpatialTile::new(1, 16), c.k_total), 5 * 16 * 8);
    }

    #[test]
    fn test_assemble_marks_full_loads() {
        let c = core(ConvBuilder::forward(1, 16, 32, [1, 8, 8], [1, 3, 3]), SplitMode::M);
        let l0 = L0Tile {
            spatial: SpatialTile::new(1, 16),
            k: 144,
            n: 16,
        };
        let al1 = AL1Tile {
            spatial: SpatialTile::new(1, c.spatial.wo),
            k: c.k_total,
        };
        let bl1 = BL1Tile { k: c.k_total, n: 16 };
        let t = TileShape::assemble(
            &c,
            l0,
            al1,
            bl1,
            PingPong::SINGLE,
            IterOrder::NFirst,
            false,
            LoadB1Condition::Full,
        );
        assert!(t.al1_full_load);
        assert!(!t.bl1_full_load);
        assert_eq!(t.n_iters(&c), 2);
        assert_eq!(t.tails.n, 16);
        assert!(t.is_consistent(&c));
    }

    proptest! {
        #[test]
        fn test_pingpong_flag_roundtrips(flag in 0u8..64) {
            prop_assert_eq!(PingPong::from_flag(flag).flag(), flag);
        }

        #[test]
        fn test_fmap_bytes_grow_with_tile(
            h in 4i64..64, w in 4i64..64, k in 1i64..4, rows in 1u64..4, blocks in 1u64..4,
        ) {
            let c = core(ConvBuilder::forward(1, 16, 16, [1, h, w], [1, k, k]), SplitMode::Hw);
            let small = c.fmap_l1_bytes(SpatialTile::new(rows, 16), c.k_window);
            let large = c.fmap_l1_bytes(SpatialTile::new(rows + 1, 16 * blocks), c.k_window);
            prop_assert!(small <= large);
            prop_assert_eq!(small % C0_BYTES, 0);
        }
    }
}
