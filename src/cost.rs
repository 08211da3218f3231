use auto_impl::auto_impl;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::blockdim::{BlockDims, SplitMode, SplitStrategy, Strategy};
use crate::shape::ConvProblem;
use crate::tiling::{CoreShape, IterOrder, TileShape};
use crate::utils::{align_up, ceil_div};

pub type MainCost = u64;

/// Byte identity of an estimator's parameters, stable across builds.
pub type Fingerprint = SmallVec<[u8; 32]>;

/// Ranks block-dim and tile candidates. Lower is better.
#[auto_impl(&, Box, Rc, Arc)]
pub trait CostEstimator {
    fn block_dim_cost(&self, problem: &ConvProblem, mode: SplitMode, dims: &BlockDims) -> MainCost;

    fn tile_cost(&self, core: &CoreShape, tile: &TileShape) -> MainCost;

    /// Equal for estimators that always rank candidates identically.
    fn fingerprint(&self) -> Fingerprint;
}

/// Tunable weights of [TrafficCostModel]. Calibrate per target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CostCoefficients {
    /// Elements per cycle moved from global memory.
    pub l2_elems_per_cycle: u64,
    /// Bytes per cycle moved from global memory into L1.
    pub l1_bytes_per_cycle: u64,
    /// Multiplier on weight traffic relative to activation traffic.
    pub weight_reload_factor: u64,
    /// Cycles of issue and synchronization per L0 iteration.
    pub l0_iteration_overhead: u64,
}

impl Default for CostCoefficients {
    fn default() -> Self {
        CostCoefficients {
            l2_elems_per_cycle: 128,
            l1_bytes_per_cycle: 64,
            weight_reload_factor: 2,
            l0_iteration_overhead: 32,
        }
    }
}

/// Approximates per-core time as global-memory traffic plus cube cycles.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TrafficCostModel {
    pub coefficients: CostCoefficients,
}

impl TrafficCostModel {
    pub fn new(coefficients: CostCoefficients) -> Self {
        TrafficCostModel { coefficients }
    }
}

impl CostEstimator for TrafficCostModel {
    fn block_dim_cost(&self, problem: &ConvProblem, mode: SplitMode, dims: &BlockDims) -> MainCost {
        let c = &self.coefficients;
        let cube = problem.cube();
        let (fmap_pos, out_pos) = Strategy::from(mode).positions(problem, &dims.spatial);
        let outer = dims.batch.single * dims.group.single * dims.depth.single;
        let reduction = problem.kernel.d * problem.cin1() * cube.k0;
        let window = problem.kernel.h * problem.kernel.w;

        let fmap = outer * fmap_pos * reduction;
        let weight = dims.batch.single * dims.group.single * reduction * window * dims.n.single;
        let out = outer * out_pos * dims.n.single;
        let cube_cycles = outer
            * ceil_div(dims.n.single, cube.n0)
            * problem.kernel.d
            * problem.cin1()
            * window
            * ceil_div(align_up(out_pos, cube.m0), cube.m0);

        let traffic = fmap + weight * c.weight_reload_factor + out;
        (ceil_div(traffic, c.l2_elems_per_cycle) + cube_cycles) * problem.phases
    }

    fn tile_cost(&self, core: &CoreShape, tile: &TileShape) -> MainCost {
        let c = &self.coefficients;
        let cube = core.cube;
        let m_iters = tile.m_iters(core);
        let n_iters = tile.n_iters(core);
        let ka_iters = tile.ka_iters(core);
        let kb_iters = tile.kb_iters(core);

        let fmap_pass = core.fmap_l1_bytes(tile.al1.spatial, tile.al1.k) * m_iters * ka_iters;
        let weight_pass = core.weight_l1_bytes(tile.bl1.k, tile.bl1.n) * n_iters * kb_iters;
        // Passes over each operand the loop nest makes.
        let (fmap_loads, weight_loads) = match tile.iter_order {
            IterOrder::MFirst => (
                if tile.al1_full_load { 1 } else { n_iters },
                if tile.bl1_full_load || kb_iters == 1 { 1 } else { m_iters },
            ),
            IterOrder::NFirst => (
                if tile.al1_full_load || ka_iters == 1 { 1 } else { n_iters },
                if tile.bl1_full_load { 1 } else { m_iters },
            ),
            IterOrder::KFirst => (1, 1),
        };
        let out_bytes = core.spatial.positions() * core.n * core.out_bytes;
        let traffic = fmap_pass * fmap_loads
            + weight_pass * weight_loads * c.weight_reload_factor
            + out_bytes;
        let dma = ceil_div(traffic, c.l1_bytes_per_cycle);

        let l0 = &tile.l0;
        let l0_iters = tile.l0_iters(core);
        let mmad = l0_iters
            * (ceil_div(l0.spatial.positions(), cube.m0)
                * ceil_div(l0.n, cube.n0)
                * ceil_div(l0.k, cube.k0)
                + c.l0_iteration_overhead);

        let pb = &tile.pingpong;
        let per_pass = if pb.al1 == 2 || pb.bl1 == 2 {
            dma.max(mmad)
        } else {
            dma + mmad
        };
        let l0_stall = if pb.al0 == 2 && pb.bl0 == 2 {
            0
        } else {
            l0_iters * c.l0_iteration_overhead
        };
        let writeback_stall = if pb.cl0 == 2 {
            0
        } else {
            core.spatial_iters(l0.spatial) * ceil_div(core.n, l0.n) * c.l0_iteration_overhead
        };
        (per_pass + l0_stall + writeback_stall) * core.outer_iters
    }

    fn fingerprint(&self) -> Fingerprint {
        // Infallible for plain integer fields.
        SmallVec::from_vec(bincode::serialize(&self.coefficients).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdim::{AxisSplit, BlockDimResult};
    use crate::shape::ConvBuilder;
    use crate::target::{PlatformBudget, TargetId};
    use crate::validate::validate;
    use std::sync::Arc;

    fn problem() -> ConvProblem {
        let budget = PlatformBudget::for_target(TargetId::Cube32);
        validate(
            &ConvBuilder::forward(1, 64, 64, [1, 34, 34], [1, 3, 3]).build(),
            &budget.limits,
        )
        .unwrap()
        .problem()
    }

    #[test]
    fn test_splitting_spatial_lowers_cost() {
        let p = problem();
        let model = TrafficCostModel::default();
        let single = BlockDimResult::single_core(&p, SplitMode::M);
        let mut split = single.dims;
        split.spatial = AxisSplit::new(split.spatial.total, 8, 16);
        assert!(
            model.block_dim_cost(&p, SplitMode::M, &split)
                < model.block_dim_cost(&p, SplitMode::M, &single.dims)
        );
    }

    #[test]
    fn test_fingerprint_tracks_coefficients() {
        let a = TrafficCostModel::default();
        let b = TrafficCostModel::new(CostCoefficients {
            weight_reload_factor: 5,
            ..CostCoefficients::default()
        });
        assert_eq!(a.fingerprint(), TrafficCostModel::default().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_fingerprint_is_the_encoded_coefficients() {
        let model = TrafficCostModel::new(CostCoefficients {
            l2_elems_per_cycle: 1,
            l1_bytes_per_cycle: 2,
            weight_reload_factor: 3,
            l0_iteration_overhead: 4,
        });
        let expected = [1u64, 2, 3, 4]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect::<Vec<u8>>();
        assert_eq!(model.fingerprint().as_slice(), expected.as_slice());
    }

    #[test]
    fn test_estimator_through_smart_pointers() {
        let p = problem();
        let dims = BlockDimResult::single_core(&p, SplitMode::Hw).dims;
        let model = TrafficCostModel::default();
        let shared: Arc<dyn CostEstimator> = Arc::new(model.clone());
        assert_eq!(
            shared.block_dim_cost(&p, SplitMode::Hw, &dims),
            model.block_dim_cost(&p, SplitMode::Hw, &dims)
        );
    }
}
