//! Tile shape search within one core's slice of the problem.
//!
//! The search is greedy with a local refinement, not exhaustive:
//!
//! 1. pick the largest L0 tiles (or the first fitting basic block),
//! 2. enable L0 double buffering where it fits, optionally shrinking K to make room,
//! 3. fit L1 tiles around the L0 tiles, preferring full loads of either operand,
//! 4. enable L1 double buffering for streamed operands and keep the whole bias resident,
//! 5. when no L1 tiling exists, shrink the L0 tiles and retry.
//!
//! Every footprint is checked after block alignment.

use log::{debug, trace};
use serde::{Deserialize, Serialize};

use crate::blockdim::{BlockDimResult, SplitMode};
use crate::common::DimSize;
use crate::cost::{CostEstimator, MainCost};
use crate::error::{Infeasibility, TilingError};
use crate::kernelsplit::KernelSplitMode;
use crate::memorylimits::MemVec;
use crate::shape::ConvProblem;
use crate::target::{MemoryLevel, PlatformBudget};
use crate::tiling::{
    l0_footprint, AL1Tile, BL1Tile, CoreShape, IterOrder, L0Tile, LoadB1Condition, PingPong,
    SpatialTile, TileShape,
};
use crate::utils::{align_up, block_candidates, ceil_div, factors, lcm};

/// (m, n) basic blocks, best first.
const BASIC_BLOCKS: [(DimSize, DimSize); 6] = [
    (256, 128),
    (128, 256),
    (128, 128),
    (64, 128),
    (128, 64),
    (64, 64),
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Shrink K at L0 (by at most half) when that is what double-buffering A and B needs.
    pub trade_k_for_double_buffer: bool,
    /// Start L0 from the basic-block list rather than the greedy maximum.
    pub basic_block: bool,
    /// Allow loading the weight a kernel row or a kernel tap at a time.
    pub allow_window_tiling: bool,
    /// Retry infeasible backprop-input problems with a kernel split.
    pub kernel_split: bool,
}

impl Default for SearchConfig {
    fn default() -> Self {
        SearchConfig {
            trade_k_for_double_buffer: true,
            basic_block: false,
            allow_window_tiling: true,
            kernel_split: true,
        }
    }
}

/// Tile sizes legal at L0 for one core and weight load mode, each ascending.
struct Candidates {
    load_b1: LoadB1Condition,
    spatial: Vec<SpatialTile>,
    k: Vec<DimSize>,
    n: Vec<DimSize>,
}

impl Candidates {
    fn new(core: &CoreShape, load_b1: LoadB1Condition) -> Self {
        let k0 = core.cube.k0;
        let unit = load_b1.weight_unit(core);
        let k = factors(core.k_total / k0)
            .into_iter()
            .map(|d| d * k0)
            .filter(|&k| {
                core.k_total % lcm(k, unit) == 0 && core.k_total % lcm(k, core.k_window) == 0
            })
            .collect();
        let n0 = core.cube.n0;
        let n = block_candidates(core.n / n0)
            .into_iter()
            .map(|b| b * n0)
            .collect();
        Candidates {
            load_b1,
            spatial: l0_spatial_candidates(core),
            k,
            n,
        }
    }

    /// AL1 K extents for L0 K `l0_k`: multiples of the kernel window and of `l0_k`.
    fn al1_k(&self, core: &CoreShape, l0_k: DimSize) -> Vec<DimSize> {
        divisor_multiples(core.k_total, lcm(l0_k, core.k_window))
    }

    /// BL1 K extents for L0 K `l0_k`: multiples of the weight unit and of `l0_k`.
    fn bl1_k(&self, core: &CoreShape, l0_k: DimSize) -> Vec<DimSize> {
        divisor_multiples(core.k_total, lcm(l0_k, self.load_b1.weight_unit(core)))
    }

    fn bl1_n(&self, core: &CoreShape, l0_n: DimSize) -> Vec<DimSize> {
        block_candidates(ceil_div(core.n, l0_n))
            .into_iter()
            .map(|t| t * l0_n)
            .collect()
    }
}

/// Multiples of `step` dividing `total`, ascending.
fn divisor_multiples(total: DimSize, step: DimSize) -> Vec<DimSize> {
    if step == 0 || total % step != 0 {
        return vec![];
    }
    factors(total / step).into_iter().map(|f| f * step).collect()
}

fn sort_spatial(mut tiles: Vec<SpatialTile>) -> Vec<SpatialTile> {
    tiles.sort_by_key(|t| (t.positions(), t.ho));
    tiles.dedup();
    tiles
}

/// L0 spatial tiles: flat M chunks, or in HW mode partial rows and whole rows.
fn l0_spatial_candidates(core: &CoreShape) -> Vec<SpatialTile> {
    let m0 = core.cube.m0;
    match core.mode {
        SplitMode::M => sort_spatial(
            block_candidates(ceil_div(core.spatial.wo, m0))
                .into_iter()
                .map(|b| SpatialTile::new(1, b * m0))
                .collect(),
        ),
        SplitMode::Hw => {
            let row = align_up(core.out_w, m0);
            let partial = block_candidates(row / m0)
                .into_iter()
                .map(|b| b * m0)
                .filter(|&wo| wo < row)
                .map(|wo| SpatialTile::new(1, wo));
            let whole = block_candidates(core.spatial.ho)
                .into_iter()
                .map(|r| SpatialTile::new(r, row));
            sort_spatial(partial.chain(whole).collect())
        }
    }
}

/// AL1 spatial tiles that nest whole L0 tiles `l0`.
fn al1_spatial_candidates(core: &CoreShape, l0: SpatialTile) -> Vec<SpatialTile> {
    match core.mode {
        SplitMode::M => sort_spatial(
            block_candidates(ceil_div(core.spatial.wo, l0.wo))
                .into_iter()
                .map(|t| SpatialTile::new(1, t * l0.wo))
                .collect(),
        ),
        SplitMode::Hw => {
            let row = align_up(core.out_w, core.cube.m0);
            let mut tiles = vec![];
            if l0.wo < row {
                tiles.extend(
                    block_candidates(ceil_div(row, l0.wo))
                        .into_iter()
                        .map(|t| t * l0.wo)
                        .filter(|&wo| wo <= row)
                        .map(|wo| SpatialTile::new(1, wo)),
                );
            }
            if row % l0.wo == 0 {
                tiles.extend(
                    block_candidates(ceil_div(core.spatial.ho, l0.ho))
                        .into_iter()
                        .map(|t| SpatialTile::new(t * l0.ho, row)),
                );
            }
            sort_spatial(tiles)
        }
    }
}

/// The L1 arrangement around an L0 tile, before iteration order is fixed.
#[derive(Clone, Copy, Debug)]
struct L1Choice {
    al1: AL1Tile,
    bl1: BL1Tile,
}

pub struct TileShapeSearch<'a, C> {
    budget: &'a PlatformBudget,
    cost: &'a C,
    config: SearchConfig,
}

impl<'a, C: CostEstimator> TileShapeSearch<'a, C> {
    pub fn new(budget: &'a PlatformBudget, cost: &'a C, config: SearchConfig) -> Self {
        TileShapeSearch {
            budget,
            cost,
            config,
        }
    }

    /// Chooses tiles for one core of `block`.
    ///
    /// Fails with [Infeasibility::Capacity] when even the smallest aligned tiles overflow
    /// some level.
    pub fn search(&self, problem: &ConvProblem, block: &BlockDimResult) -> Result<TileShape, TilingError> {
        let core = CoreShape::new(problem, block);
        let capacity = &self.budget.capacity;
        let min_l0 = core.min_l0_footprint();
        if let Some(level) = min_l0.first_overflow(capacity) {
            return Err(Infeasibility::Capacity {
                level,
                needed: min_l0[level],
                capacity: capacity[level],
            }
            .into());
        }

        let basic_block = self.config.basic_block || problem.kernel_split != KernelSplitMode::None;
        let l1_capacity = capacity[MemoryLevel::L1];
        let mut min_needed = u64::MAX;
        for load_b1 in core.load_b1_modes(self.config.allow_window_tiling) {
            let needed = core.min_l1_bytes(load_b1);
            min_needed = min_needed.min(needed);
            if needed > l1_capacity {
                debug!("Weight load {} needs {} L1 bytes at least", load_b1, needed);
                continue;
            }
            let space = Candidates::new(&core, load_b1);
            if let Some(tile) = self.search_mode(&core, &space, basic_block) {
                debug!("Tile shape: {}", tile);
                return Ok(tile);
            }
        }
        Err(Infeasibility::Capacity {
            level: MemoryLevel::L1,
            needed: min_needed,
            capacity: l1_capacity,
        }
        .into())
    }

    fn search_mode(&self, core: &CoreShape, space: &Candidates, basic_block: bool) -> Option<TileShape> {
        let mut l0 = if basic_block {
            self.basic_block_l0(core, space)
        } else {
            None
        }
        .or_else(|| self.greedy_l0(core, space))?;
        loop {
            let (buffered, pb) = self.l0_pingpong(core, space, l0);
            trace!("Trying L0 {:?} with {:06b}", buffered, pb.flag());
            if let Some(tile) = self.fit_l1(core, space, buffered, pb) {
                return Some(tile);
            }
            l0 = shrink_l0(space, l0)?;
        }
    }

    fn l0_fits(&self, core: &CoreShape, l0: &L0Tile, pb: &PingPong) -> bool {
        l0_footprint(core, l0, pb).fits(&self.budget.capacity)
    }

    /// The single-buffered L0 tile of largest volume.
    fn greedy_l0(&self, core: &CoreShape, space: &Candidates) -> Option<L0Tile> {
        let mut best: Option<L0Tile> = None;
        let volume = |t: &L0Tile| (t.spatial.positions() * t.n * t.k, t.spatial.positions() * t.n);
        for &spatial in &space.spatial {
            for &n in &space.n {
                // The largest fitting K for this (m, n); fitting is monotone in K.
                let tile = space
                    .k
                    .iter()
                    .rev()
                    .map(|&k| L0Tile { spatial, k, n })
                    .find(|t| self.l0_fits(core, t, &PingPong::SINGLE));
                if let Some(t) = tile {
                    if best.map_or(true, |b| volume(&t) > volume(&b)) {
                        best = Some(t);
                    }
                }
            }
        }
        best
    }

    /// The first basic block that fits double-buffered, clamped to the core's extents.
    fn basic_block_l0(&self, core: &CoreShape, space: &Candidates) -> Option<L0Tile> {
        let pb = PingPong {
            al0: 2,
            bl0: 2,
            ..PingPong::SINGLE
        };
        BASIC_BLOCKS.iter().find_map(|&(m, n)| {
            let spatial = space
                .spatial
                .iter()
                .rev()
                .find(|s| s.positions() <= m)
                .copied()?;
            let n = space.n.iter().rev().find(|&&c| c <= n).copied()?;
            space
                .k
                .iter()
                .rev()
                .map(|&k| L0Tile { spatial, k, n })
                .find(|t| self.l0_fits(core, t, &pb))
        })
    }

    /// Enables L0 double buffering greedily: A and B together, then C, then UB.
    fn l0_pingpong(&self, core: &CoreShape, space: &Candidates, l0: L0Tile) -> (L0Tile, PingPong) {
        let mut l0 = l0;
        let mut pb = PingPong::SINGLE;
        let ab = PingPong {
            al0: 2,
            bl0: 2,
            ..pb
        };
        if self.l0_fits(core, &l0, &ab) {
            pb = ab;
        } else if let Some(traded) = self
            .config
            .trade_k_for_double_buffer
            .then(|| {
                space
                    .k
                    .iter()
                    .rev()
                    .filter(|&&k| k < l0.k && 2 * k >= l0.k)
                    .map(|&k| L0Tile { k, ..l0 })
                    .find(|t| self.l0_fits(core, t, &ab))
            })
            .flatten()
        {
            l0 = traded;
            pb = ab;
        } else {
            for single in [
                PingPong { al0: 2, ..pb },
                PingPong { bl0: 2, ..pb },
            ] {
                if self.l0_fits(core, &l0, &single) {
                    pb = single;
                    break;
                }
            }
        }
        let c = PingPong { cl0: 2, ..pb };
        if self.l0_fits(core, &l0, &c) {
            pb = c;
        }
        if core.enlarged {
            let u = PingPong { ub: 2, ..pb };
            if self.l0_fits(core, &l0, &u) {
                pb = u;
            }
        }
        (l0, pb)
    }

    fn assemble(
        &self,
        core: &CoreShape,
        space: &Candidates,
        l0: L0Tile,
        choice: L1Choice,
        pb: PingPong,
        order: IterOrder,
        bias_full: bool,
    ) -> TileShape {
        TileShape::assemble(
            core,
            l0,
            choice.al1,
            choice.bl1,
            pb,
            order,
            bias_full,
            space.load_b1,
        )
    }

    /// Cost with the better of the two streaming orders, or K order when only K streams.
    fn ordered(
        &self,
        core: &CoreShape,
        space: &Candidates,
        l0: L0Tile,
        choice: L1Choice,
        pb: PingPong,
        bias_full: bool,
    ) -> (MainCost, TileShape) {
        let trial = self.assemble(core, space, l0, choice, pb, IterOrder::MFirst, bias_full);
        let orders: &[IterOrder] = if trial.m_iters(core) == 1 && trial.n_iters(core) == 1 {
            if trial.ka_iters(core) > 1 || trial.kb_iters(core) > 1 {
                &[IterOrder::KFirst]
            } else {
                &[IterOrder::NFirst]
            }
        } else if trial.al1_full_load {
            &[IterOrder::NFirst]
        } else if trial.bl1_full_load {
            &[IterOrder::MFirst]
        } else {
            &[IterOrder::MFirst, IterOrder::NFirst]
        };
        orders
            .iter()
            .map(|&order| {
                let tile = self.assemble(core, space, l0, choice, pb, order, bias_full);
                (self.cost.tile_cost(core, &tile), tile)
            })
            .min_by_key(|(cost, _)| *cost)
            .unwrap_or_else(|| (self.cost.tile_cost(core, &trial), trial))
    }

    fn footprint(&self, core: &CoreShape, space: &Candidates, l0: L0Tile, choice: L1Choice, pb: PingPong) -> MemVec {
        self.assemble(core, space, l0, choice, pb, IterOrder::MFirst, false)
            .footprint(core)
    }

    fn l1_fits(&self, core: &CoreShape, space: &Candidates, l0: L0Tile, choice: L1Choice, pb: PingPong) -> bool {
        self.footprint(core, space, l0, choice, pb)
            .fits(&self.budget.capacity)
    }

    /// L1 tiles around `l0`: both operands resident, else the cheaper single full load,
    /// else a local search over streamed tiles.
    fn fit_l1(&self, core: &CoreShape, space: &Candidates, l0: L0Tile, pb: PingPong) -> Option<TileShape> {
        let spatial = al1_spatial_candidates(core, l0.spatial);
        let ka = space.al1_k(core, l0.k);
        let kb = space.bl1_k(core, l0.k);
        let ns = space.bl1_n(core, l0.n);
        let full_a = AL1Tile {
            spatial: *spatial.last()?,
            k: core.k_total,
        };
        let full_b = BL1Tile {
            k: core.k_total,
            n: *ns.last()?,
        };

        let all_full = L1Choice {
            al1: full_a,
            bl1: full_b,
        };
        let choice = if self.l1_fits(core, space, l0, all_full, pb) {
            all_full
        } else {
            let a_full = kb
                .iter()
                .flat_map(|&k| ns.iter().map(move |&n| BL1Tile { k, n }))
                .map(|bl1| L1Choice { al1: full_a, bl1 });
            let b_full = spatial
                .iter()
                .flat_map(|&s| ka.iter().map(move |&k| AL1Tile { spatial: s, k }))
                .map(|al1| L1Choice { al1, bl1: full_b });
            let k_full = spatial.iter().flat_map(|&s| {
                ns.iter().map(move |&n| L1Choice {
                    al1: AL1Tile { spatial: s, k: core.k_total },
                    bl1: BL1Tile { k: core.k_total, n },
                })
            });
            let fitting = a_full
                .chain(b_full)
                .chain(k_full)
                .filter(|&c| self.l1_fits(core, space, l0, c, pb))
                .collect::<Vec<_>>();
            // Prefer equal K tiles whenever one fits.
            let any_equal = fitting.iter().any(|c| c.al1.k == c.bl1.k);
            fitting
                .into_iter()
                .filter(|c| !any_equal || c.al1.k == c.bl1.k)
                .map(|c| (self.ordered(core, space, l0, c, pb, false).0, c))
                .min_by_key(|(cost, _)| *cost)
                .map(|(_, c)| c)
                .or_else(|| self.streamed_l1(core, space, l0, pb, &spatial, &ka, &kb, &ns))?
        };

        let pb = self.l1_pingpong(core, space, l0, choice, pb);
        let bias_full = core.bias_bytes.is_some() && {
            let tile = self.assemble(core, space, l0, choice, pb, IterOrder::MFirst, true);
            tile.fits(core, self.budget)
        };
        Some(self.ordered(core, space, l0, choice, pb, bias_full).1)
    }

    /// Grows streamed L1 tiles from the minimum while the estimated cost drops.
    #[allow(clippy::too_many_arguments)]
    fn streamed_l1(
        &self,
        core: &CoreShape,
        space: &Candidates,
        l0: L0Tile,
        pb: PingPong,
        spatial: &[SpatialTile],
        ka: &[DimSize],
        kb: &[DimSize],
        ns: &[DimSize],
    ) -> Option<L1Choice> {
        let nested = |c: &L1Choice| c.al1.k % c.bl1.k == 0 || c.bl1.k % c.al1.k == 0;
        let mut current = L1Choice {
            al1: AL1Tile {
                spatial: *spatial.first()?,
                k: *ka.first()?,
            },
            bl1: BL1Tile {
                k: *kb.first()?,
                n: *ns.first()?,
            },
        };
        if !nested(&current) || !self.l1_fits(core, space, l0, current, pb) {
            return None;
        }
        let mut current_cost = self.ordered(core, space, l0, current, pb, false).0;
        loop {
            let next = |list: &[DimSize], v: DimSize| list.iter().copied().find(|&x| x > v);
            let next_spatial = spatial
                .iter()
                .copied()
                .find(|s| s.positions() > current.al1.spatial.positions());
            let k_both = next(ka, current.al1.k).and_then(|a| {
                kb.iter()
                    .copied()
                    .filter(|&b| b > current.bl1.k && (a % b == 0 || b % a == 0))
                    .last()
                    .map(|b| (a, b))
            });
            let moves = [
                k_both.map(|(a, b)| L1Choice {
                    al1: AL1Tile { k: a, ..current.al1 },
                    bl1: BL1Tile { k: b, ..current.bl1 },
                }),
                next(ka, current.al1.k).map(|k| L1Choice {
                    al1: AL1Tile { k, ..current.al1 },
                    ..current
                }),
                next(kb, current.bl1.k).map(|k| L1Choice {
                    bl1: BL1Tile { k, ..current.bl1 },
                    ..current
                }),
                next_spatial.map(|s| L1Choice {
                    al1: AL1Tile {
                        spatial: s,
                        ..current.al1
                    },
                    ..current
                }),
                next(ns, current.bl1.n).map(|n| L1Choice {
                    bl1: BL1Tile { n, ..current.bl1 },
                    ..current
                }),
            ];
            let best = moves
                .into_iter()
                .flatten()
                .filter(|c| nested(c) && self.l1_fits(core, space, l0, *c, pb))
                .map(|c| (self.ordered(core, space, l0, c, pb, false).0, c))
                .min_by_key(|(cost, _)| *cost);
            match best {
                Some((cost, c)) if cost < current_cost => {
                    current = c;
                    current_cost = cost;
                }
                _ => return Some(current),
            }
        }
    }

    /// Double-buffers the streamed L1 operands, A first.
    fn l1_pingpong(&self, core: &CoreShape, space: &Candidates, l0: L0Tile, choice: L1Choice, pb: PingPong) -> PingPong {
        let trial = self.assemble(core, space, l0, choice, pb, IterOrder::MFirst, false);
        let mut pb = pb;
        if !trial.al1_full_load {
            let a = PingPong { al1: 2, ..pb };
            if self.l1_fits(core, space, l0, choice, a) {
                pb = a;
            }
        }
        if !trial.bl1_full_load {
            let b = PingPong { bl1: 2, ..pb };
            if self.l1_fits(core, space, l0, choice, b) {
                pb = b;
            }
        }
        pb
    }
}

/// The next smaller L0 tile: K first, then the larger of M and N.
fn shrink_l0(space: &Candidates, l0: L0Tile) -> Option<L0Tile> {
    let prev = |list: &[DimSize], v: DimSize| list.iter().rev().copied().find(|&x| x < v);
    if let Some(k) = prev(&space.k, l0.k) {
        return Some(L0Tile { k, ..l0 });
    }
    let smaller_spatial = space
        .spatial
        .iter()
        .rev()
        .copied()
        .find(|s| s.positions() < l0.spatial.positions());
    let smaller_n = prev(&space.n, l0.n);
    let k = *space.k.last()?;
    match (smaller_spatial, smaller_n) {
        (Some(spatial), Some(_)) if l0.spatial.positions() >= l0.n => {
            Some(L0Tile { spatial, k, ..l0 })
        }
        (_, Some(n)) => Some(L0Tile { n, k, ..l0 }),
        (Some(spatial), None) => Some(L0Tile { spatial, k, ..l0 }),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdim::BlockDimDecision;
    use crate::cost::TrafficCostModel;
    use crate::kernelsplit::{applicable_split, split_problem};
    use crate::shape::ConvBuilder;
    use crate::target::TargetId;
    use crate::validate::validate;
    use proptest::prelude::*;

    fn plan(
        budget: &PlatformBudget,
        builder: ConvBuilder,
        config: SearchConfig,
    ) -> (ConvProblem, BlockDimResult, Result<TileShape, TilingError>) {
        let spec = validate(&builder.build(), &budget.limits).unwrap();
        let problem = spec.problem();
        let cost = TrafficCostModel::default();
        let block = BlockDimDecision::new(budget, &cost).decide(&problem).unwrap();
        let tile = TileShapeSearch::new(budget, &cost, config).search(&problem, &block);
        (problem, block, tile)
    }

    #[test]
    fn test_forward_3x3_window_fits_one_l1_tile() {
        let budget = PlatformBudget::for_target(TargetId::Cube32);
        let (problem, block, tile) = plan(
            budget,
            ConvBuilder::forward(1, 256, 256, [1, 34, 34], [1, 3, 3]),
            SearchConfig::default(),
        );
        let tile = tile.unwrap();
        let core = CoreShape::new(&problem, &block);
        assert_eq!(tile.load_b1, LoadB1Condition::Full);
        assert_eq!(tile.al1.k % core.k_window, 0);
        assert_eq!(tile.al1.k, tile.bl1.k);
        assert!(tile.fits(&core, budget));
        assert!(tile.is_consistent(&core));
    }

    #[test]
    fn test_unsplit_strided_backprop_overflows_small_l1() {
        let budget = PlatformBudget::for_target(TargetId::Cube32)
            .clone()
            .with_capacity(MemoryLevel::L1, 2112);
        let spec = validate(
            &ConvBuilder::backprop_input(1, 256, 256, [1, 34, 34], [1, 3, 3])
                .stride([1, 2, 2])
                .build(),
            &budget.limits,
        )
        .unwrap();
        let cost = TrafficCostModel::default();
        let problem = spec.problem();
        for mode in [SplitMode::M, SplitMode::Hw] {
            let block = BlockDimResult::single_core(&problem, mode);
            let result = TileShapeSearch::new(&budget, &cost, SearchConfig::default())
                .search(&problem, &block);
            assert!(matches!(
                result,
                Err(TilingError::Infeasible(Infeasibility::Capacity {
                    level: MemoryLevel::L1,
                    ..
                }))
            ));
        }

        let mode = applicable_split(&spec);
        assert_eq!(mode, KernelSplitMode::SplitHw);
        let split = split_problem(&spec, mode).unwrap();
        let block = BlockDimDecision::new(&budget, &cost).decide(&split).unwrap();
        let tile = TileShapeSearch::new(&budget, &cost, SearchConfig::default())
            .search(&split, &block)
            .unwrap();
        let core = CoreShape::new(&split, &block);
        assert!(tile.fits(&core, &budget));
    }

    #[test]
    fn test_small_problem_loads_everything_once() {
        let budget = PlatformBudget::for_target(TargetId::Cube32);
        let (problem, block, tile) = plan(
            budget,
            ConvBuilder::forward(1, 16, 16, [1, 8, 8], [1, 3, 3]),
            SearchConfig::default(),
        );
        let tile = tile.unwrap();
        let core = CoreShape::new(&problem, &block);
        assert!(tile.al1_full_load);
        assert!(tile.bl1_full_load);
        assert_eq!(tile.m_iters(&core), 1);
        assert_eq!(tile.n_iters(&core), 1);
    }

    #[test]
    fn test_basic_block_is_double_buffered() {
        let budget = PlatformBudget::for_target(TargetId::Cube32);
        let config = SearchConfig {
            basic_block: true,
            ..SearchConfig::default()
        };
        let (_, _, tile) = plan(
            budget,
            ConvBuilder::forward(8, 512, 512, [1, 64, 64], [1, 1, 1]),
            config,
        );
        let tile = tile.unwrap();
        assert_eq!(tile.pingpong.al0, 2);
        assert_eq!(tile.pingpong.bl0, 2);
    }

    #[test]
    fn test_divisor_multiples() {
        assert_eq!(divisor_multiples(144, 48), vec![48, 144]);
        assert!(divisor_multiples(144, 64).is_empty());
    }

    fn arb_forward() -> impl Strategy<Value = ConvBuilder> {
        (
            1i64..3,
            1i64..300,
            1i64..300,
            4i64..60,
            4i64..60,
            1i64..6,
            1i64..3,
            any::<bool>(),
            prop_oneof![Just(Dtype::Float16), Just(Dtype::Float32), Just(Dtype::Int8)],
        )
            .prop_map(|(batch, ci, co, h, w, k, s, bias, dtype)| {
                ConvBuilder::forward(batch, ci, co, [1, h, w], [1, k.min(h), k.min(w)])
                    .stride([1, s, s])
                    .bias(bias)
                    .dtype(dtype)
            })
    }

    use crate::common::Dtype;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn test_capacity_and_full_load_invariants(
            builder in arb_forward(),
            target in any::<TargetId>(),
            basic_block in any::<bool>(),
        ) {
            let budget = PlatformBudget::for_target(target);
            let config = SearchConfig { basic_block, ..SearchConfig::default() };
            let (problem, block, tile) = plan(budget, builder, config);
            let tile = tile.unwrap();
            let core = CoreShape::new(&problem, &block);
            prop_assert!(tile.footprint(&core).fits(&budget.capacity));
            prop_assert!(tile.is_consistent(&core));
            if tile.al1_full_load {
                prop_assert_eq!(tile.m_iters(&core), 1);
                prop_assert_eq!(tile.ka_iters(&core), 1);
            }
            if tile.bl1_full_load {
                prop_assert_eq!(tile.n_iters(&core), 1);
                prop_assert_eq!(tile.kb_iters(&core), 1);
            }
        }
    }
}
