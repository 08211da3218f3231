//! Partitioning of a convolution's output across cube cores.

use enum_dispatch::enum_dispatch;
use itertools::Itertools;
use log::debug;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::fmt;

use crate::common::DimSize;
use crate::cost::{CostEstimator, MainCost};
use crate::error::{Infeasibility, TilingError};
use crate::shape::ConvProblem;
use crate::target::{InstrLimits, MemoryLevel, PlatformBudget};
use crate::tiling::CoreShape;
use crate::utils::{ceil_div, factors, merge_ascending};

/// Bytes one core should write per output burst in HW mode.
const L2_BURST_BYTES: u64 = 128;

/// How the output spatial extent is distributed.
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
pub enum SplitMode {
    /// Ho*Wo flattened into one GEMM M axis.
    M,
    /// Whole output rows.
    Hw,
}

impl SplitMode {
    pub fn code(&self) -> u8 {
        match self {
            SplitMode::M => 0,
            SplitMode::Hw => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SplitMode::M),
            1 => Some(SplitMode::Hw),
            _ => None,
        }
    }
}

impl fmt::Display for SplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SplitMode::M => write!(f, "M"),
            SplitMode::Hw => write!(f, "HW"),
        }
    }
}

/// One axis divided among `dim` cores: all but the last get `single`, the last gets `tail`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisSplit {
    pub total: DimSize,
    pub dim: DimSize,
    pub single: DimSize,
    pub tail: DimSize,
}

impl AxisSplit {
    /// Splits `total` into at most `dim` parts, each a multiple of `granule` except the tail.
    ///
    /// `dim` is lowered when fewer parts suffice, so that no core is left empty.
    pub fn new(total: DimSize, dim: DimSize, granule: DimSize) -> Self {
        let blocks = ceil_div(total, granule);
        let single = ceil_div(blocks, dim.max(1)) * granule;
        Self::from_single(total, single)
    }

    /// The split giving every core `single`, except a smaller tail.
    pub fn from_single(total: DimSize, single: DimSize) -> Self {
        let dim = ceil_div(total, single);
        AxisSplit {
            total,
            dim,
            single,
            tail: total - (dim - 1) * single,
        }
    }

    pub fn whole(total: DimSize, granule: DimSize) -> Self {
        Self::new(total, 1, granule)
    }

    /// Extent handled by the core at `index` along this axis.
    pub fn extent(&self, index: DimSize) -> DimSize {
        if index + 1 == self.dim {
            self.tail
        } else {
            self.single
        }
    }

    pub fn is_valid(&self) -> bool {
        self.dim >= 1
            && self.tail >= 1
            && self.tail <= self.single
            && (self.dim - 1) * self.single + self.tail == self.total
    }
}

impl fmt::Display for AxisSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({}+{})", self.total, self.dim, self.single, self.tail)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockDims {
    pub batch: AxisSplit,
    pub depth: AxisSplit,
    pub spatial: AxisSplit,
    pub n: AxisSplit,
    pub group: AxisSplit,
}

impl BlockDims {
    pub fn used_cores(&self) -> DimSize {
        self.axes().iter().map(|(_, a)| a.dim).product()
    }

    pub fn axes(&self) -> [(&'static str, &AxisSplit); 5] {
        [
            ("batch", &self.batch),
            ("depth", &self.depth),
            ("spatial", &self.spatial),
            ("n", &self.n),
            ("group", &self.group),
        ]
    }

    /// Whether every axis is a valid split of the corresponding extent of `problem`.
    pub fn covers(&self, problem: &ConvProblem, mode: SplitMode) -> bool {
        let totals = axis_totals(problem, mode);
        self.axes()
            .iter()
            .zip(totals)
            .all(|((_, axis), (total, _))| axis.total == total && axis.is_valid())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockDimResult {
    pub mode: SplitMode,
    pub dims: BlockDims,
    pub cost: MainCost,
}

impl BlockDimResult {
    /// Everything on one core.
    pub fn single_core(problem: &ConvProblem, mode: SplitMode) -> Self {
        let [batch, depth, spatial, n, group] =
            axis_totals(problem, mode).map(|(total, granule)| AxisSplit::whole(total, granule));
        BlockDimResult {
            mode,
            dims: BlockDims {
                batch,
                depth,
                spatial,
                n,
                group,
            },
            cost: 0,
        }
    }

    pub fn used_cores(&self) -> DimSize {
        self.dims.used_cores()
    }
}

impl fmt::Display for BlockDimResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = &self.dims;
        write!(
            f,
            "{} batch={} depth={} spatial={} n={} group={} cost={}",
            self.mode,
            d.batch.dim,
            d.depth.dim,
            d.spatial.dim,
            d.n.dim,
            d.group.dim,
            self.cost
        )
    }
}

/// (extent, granule) of the batch, depth, spatial, n and group axes.
pub fn axis_totals(problem: &ConvProblem, mode: SplitMode) -> [(DimSize, DimSize); 5] {
    let cube = problem.cube();
    let spatial = match mode {
        SplitMode::M => (problem.output.h * problem.output.w, cube.m0),
        SplitMode::Hw => (problem.output.h, 1),
    };
    [
        (problem.batch, 1),
        (problem.output.d, 1),
        spatial,
        (problem.cout, cube.n0),
        (problem.groups, 1),
    ]
}

/// Candidate core counts along an axis of `extent` blocks.
fn axis_range(extent: DimSize, cores: DimSize) -> Vec<DimSize> {
    let own = factors(extent)
        .into_iter()
        .filter(|&f| f <= cores)
        .collect_vec();
    let shared = factors(cores)
        .into_iter()
        .filter(|&f| f <= extent)
        .collect_vec();
    merge_ascending(&own, &shared)
}

#[enum_dispatch]
pub trait SplitStrategy {
    fn mode(&self) -> SplitMode;

    /// Instruction-level preconditions independent of the core assignment.
    fn admits(&self, problem: &ConvProblem, limits: &InstrLimits) -> bool;

    /// Spatial core counts to enumerate, and spare counts only used to fill idle cores.
    fn spatial_range(&self, problem: &ConvProblem, cores: DimSize) -> (Vec<DimSize>, Vec<DimSize>);

    /// Input and output positions one core touches, given its spatial slice.
    fn positions(&self, problem: &ConvProblem, spatial: &AxisSplit) -> (DimSize, DimSize);
}

pub struct MSplit;

pub struct HwSplit;

#[enum_dispatch(SplitStrategy)]
pub enum Strategy {
    MSplit,
    HwSplit,
}

impl From<SplitMode> for Strategy {
    fn from(mode: SplitMode) -> Self {
        match mode {
            SplitMode::M => MSplit.into(),
            SplitMode::Hw => HwSplit.into(),
        }
    }
}

impl SplitStrategy for MSplit {
    fn mode(&self) -> SplitMode {
        SplitMode::M
    }

    fn admits(&self, problem: &ConvProblem, limits: &InstrLimits) -> bool {
        if problem.input.w > limits.max_load3d_wi {
            return false;
        }
        if problem.fmap_channel_last {
            let stride = problem.cin * problem.input.h * problem.input.w * problem.dilation.d;
            if stride > limits.max_load3d_src_stride {
                return false;
            }
        }
        true
    }

    fn spatial_range(&self, problem: &ConvProblem, cores: DimSize) -> (Vec<DimSize>, Vec<DimSize>) {
        let m1 = ceil_div(problem.output.h * problem.output.w, problem.cube().m0);
        (axis_range(m1, cores), vec![])
    }

    fn positions(&self, problem: &ConvProblem, spatial: &AxisSplit) -> (DimSize, DimSize) {
        let fmap = ceil_div(problem.input.h * problem.input.w, spatial.dim);
        (fmap, spatial.single.min(spatial.total))
    }
}

impl SplitStrategy for HwSplit {
    fn mode(&self) -> SplitMode {
        SplitMode::Hw
    }

    fn admits(&self, problem: &ConvProblem, limits: &InstrLimits) -> bool {
        !problem.out_channel_last
            || problem.output.w * problem.cout <= limits.max_fixpipe_stride
    }

    fn spatial_range(&self, problem: &ConvProblem, cores: DimSize) -> (Vec<DimSize>, Vec<DimSize>) {
        let ho = problem.output.h;
        let burst_elems = ceil_div(L2_BURST_BYTES, problem.out_dtype.size());
        let min_rows = ceil_div(burst_elems, problem.output.w);
        let (valid, spare): (Vec<_>, Vec<_>) = axis_range(ho, cores)
            .into_iter()
            .partition(|&d| d == 1 || ceil_div(ho, d) >= min_rows);
        (valid, spare)
    }

    fn positions(&self, problem: &ConvProblem, spatial: &AxisSplit) -> (DimSize, DimSize) {
        let rows = spatial.single;
        let in_rows = ((rows - 1) * problem.stride.h + problem.dilated_kernel().h).min(problem.input.h);
        (in_rows * problem.input.w, rows * problem.output.w)
    }
}

/// Chooses the core assignment with the lowest estimated cost.
pub struct BlockDimDecision<'a, C> {
    budget: &'a PlatformBudget,
    cost: &'a C,
    allow_window_tiling: bool,
}

impl<'a, C: CostEstimator> BlockDimDecision<'a, C> {
    pub fn new(budget: &'a PlatformBudget, cost: &'a C) -> Self {
        BlockDimDecision {
            budget,
            cost,
            allow_window_tiling: true,
        }
    }

    pub fn allow_window_tiling(mut self, allow: bool) -> Self {
        self.allow_window_tiling = allow;
        self
    }

    /// Tries M mode, then HW mode.
    pub fn decide(&self, problem: &ConvProblem) -> Result<BlockDimResult, TilingError> {
        for strategy in [Strategy::from(MSplit), Strategy::from(HwSplit)] {
            match self.decide_with(problem, &strategy) {
                Some(result) => {
                    debug!("Block dims: {}", result);
                    return Ok(result);
                }
                None => debug!("{} split has no feasible assignment", strategy.mode()),
            }
        }
        Err(Infeasibility::BlockDim.into())
    }

    pub fn decide_with(&self, problem: &ConvProblem, strategy: &Strategy) -> Option<BlockDimResult> {
        let mode = strategy.mode();
        if !strategy.admits(problem, &self.budget.limits) {
            return None;
        }
        let needed = self.min_l1_bytes(problem, mode);
        let capacity = self.budget.capacity_of(MemoryLevel::L1);
        if needed > capacity {
            debug!("{} split needs {} L1 bytes, {} available", mode, needed, capacity);
            return None;
        }

        let cores = self.budget.core_count();
        let totals = axis_totals(problem, mode);
        let batch_range = if problem.batch >= 2 * cores {
            factors(cores)
        } else {
            axis_range(problem.batch, cores)
        };
        let depth_range = if problem.split_depth {
            axis_range(problem.output.d, cores)
        } else {
            vec![1]
        };
        let (spatial_range, spare) = strategy.spatial_range(problem, cores);
        let ranges = [
            batch_range,
            depth_range,
            spatial_range,
            axis_range(problem.cout1(), cores),
            axis_range(problem.groups, cores),
        ];

        let best = ranges
            .into_iter()
            .map(|r| r.into_iter())
            .multi_cartesian_product()
            .filter(|choice| choice.iter().product::<DimSize>() <= cores)
            .filter_map(|choice| self.candidate(problem, strategy, &totals, &choice))
            .min_by_key(Self::rank)?;
        Some(self.fill_idle_cores(problem, strategy, best, &spare))
    }

    /// Lower is better: cost, then more cores, then spatial over channel splits.
    #[allow(clippy::type_complexity)]
    fn rank(
        r: &BlockDimResult,
    ) -> (
        MainCost,
        Reverse<DimSize>,
        Reverse<DimSize>,
        Reverse<DimSize>,
        Reverse<DimSize>,
        Reverse<DimSize>,
    ) {
        let d = &r.dims;
        (
            r.cost,
            Reverse(d.used_cores()),
            Reverse(d.spatial.dim),
            Reverse(d.batch.dim),
            Reverse(d.depth.dim),
            Reverse(d.group.dim),
        )
    }

    fn candidate(
        &self,
        problem: &ConvProblem,
        strategy: &Strategy,
        totals: &[(DimSize, DimSize); 5],
        choice: &[DimSize],
    ) -> Option<BlockDimResult> {
        let mut splits = totals
            .iter()
            .zip(choice)
            .map(|(&(total, granule), &dim)| AxisSplit::new(total, dim, granule));
        let dims = BlockDims {
            batch: splits.next()?,
            depth: splits.next()?,
            spatial: splits.next()?,
            n: splits.next()?,
            group: splits.next()?,
        };
        let limits = &self.budget.limits;
        let n_blocks = ceil_div(dims.n.single, problem.cube().n0);
        if n_blocks > limits.max_free_dim || dims.spatial.single > limits.max_free_dim {
            return None;
        }
        let mode = strategy.mode();
        Some(BlockDimResult {
            mode,
            dims,
            cost: self.cost.block_dim_cost(problem, mode, &dims),
        })
    }

    /// Uses a spare spatial count when it occupies more of the otherwise idle cores.
    fn fill_idle_cores(
        &self,
        problem: &ConvProblem,
        strategy: &Strategy,
        best: BlockDimResult,
        spare: &[DimSize],
    ) -> BlockDimResult {
        let cores = self.budget.core_count();
        if best.used_cores() >= cores || spare.is_empty() {
            return best;
        }
        let (total, granule) = axis_totals(problem, strategy.mode())[2];
        let others = best.used_cores() / best.dims.spatial.dim;
        spare
            .iter()
            .rev()
            .filter(|&&s| s * others <= cores)
            .map(|&s| {
                let dims = BlockDims {
                    spatial: AxisSplit::new(total, s, granule),
                    ..best.dims
                };
                BlockDimResult {
                    mode: best.mode,
                    dims,
                    cost: self.cost.block_dim_cost(problem, best.mode, &dims),
                }
            })
            .find(|c| c.used_cores() > best.used_cores())
            .unwrap_or(best)
    }

    /// L1 bytes of the smallest tile set any core could use under `mode`.
    pub fn min_l1_bytes(&self, problem: &ConvProblem, mode: SplitMode) -> u64 {
        let core = CoreShape::new(problem, &BlockDimResult::single_core(problem, mode));
        core.load_b1_modes(self.allow_window_tiling)
            .iter()
            .map(|&m| core.min_l1_bytes(m))
            .min()
            .unwrap_or(u64::MAX)
    }
}
