//! Tuned plans looked up by exact key before any search runs.

use auto_impl::auto_impl;
use dashmap::DashMap;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::blockdim::{axis_totals, AxisSplit, BlockDimResult, BlockDims, SplitMode};
use crate::cost::CostEstimator;
use crate::kernelsplit::{split_problem, KernelSplitMode};
use crate::search::SearchConfig;
use crate::shape::{ConvProblem, ConvShapeSpec};
use crate::target::{MemoryLevel, PlatformBudget};
use crate::tiling::{
    AL1Tile, BL1Tile, CoreShape, IterOrder, L0Tile, LoadB1Condition, PingPong, SpatialTile,
    TileShape,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryKey {
    pub spec: ConvShapeSpec,
    pub search: SearchConfig,
    pub target: String,
    pub core_count: u64,
}

impl RepositoryKey {
    pub fn new(spec: &ConvShapeSpec, search: SearchConfig, budget: &PlatformBudget) -> Self {
        RepositoryKey {
            spec: spec.clone(),
            search,
            target: budget.target.name().to_string(),
            core_count: budget.core_count(),
        }
    }
}

/// A tuned plan as stored: per-core extents and tile sizes only.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TuningResult {
    pub kernel_split: u8,
    pub split_mode: u8,
    /// Single-core extents of batch, depth, spatial, n and group.
    pub singles: [u64; 5],
    pub ho_l0: u64,
    pub wo_l0: u64,
    pub k_l0: u64,
    pub n_l0: u64,
    pub ho_al1: u64,
    pub wo_al1: u64,
    pub k_al1: u64,
    pub k_bl1: u64,
    pub n_bl1: u64,
    pub pbuffer_flag: u8,
    pub iter_order: u8,
    pub load_b1: u8,
    pub bias_full_load: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslationError {
    #[error("unknown {field} code {code}")]
    UnknownCode { field: &'static str, code: u8 },
    #[error("kernel split {0} does not apply")]
    SplitNotApplicable(KernelSplitMode),
    #[error("block dims do not cover the problem")]
    Coverage,
    #[error("block dims use {used} of {cores} cores")]
    TooManyCores { used: u64, cores: u64 },
    #[error("weight load {0} is not available here")]
    LoadB1(LoadB1Condition),
    #[error("tiles violate alignment or nesting")]
    Inconsistent,
    #[error("tiles overflow {0}")]
    Capacity(MemoryLevel),
}

/// A stored plan turned back into the planner's types.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Translated {
    pub problem: ConvProblem,
    pub block: BlockDimResult,
    pub tile: TileShape,
}

impl TuningResult {
    pub fn from_plan(problem: &ConvProblem, block: &BlockDimResult, tile: &TileShape) -> Self {
        let d = &block.dims;
        TuningResult {
            kernel_split: problem.kernel_split.code(),
            split_mode: block.mode.code(),
            singles: [
                d.batch.single,
                d.depth.single,
                d.spatial.single,
                d.n.single,
                d.group.single,
            ],
            ho_l0: tile.l0.spatial.ho,
            wo_l0: tile.l0.spatial.wo,
            k_l0: tile.l0.k,
            n_l0: tile.l0.n,
            ho_al1: tile.al1.spatial.ho,
            wo_al1: tile.al1.spatial.wo,
            k_al1: tile.al1.k,
            k_bl1: tile.bl1.k,
            n_bl1: tile.bl1.n,
            pbuffer_flag: tile.pingpong.flag(),
            iter_order: tile.iter_order.code(),
            load_b1: tile.load_b1.code(),
            bias_full_load: tile.bias_full_load,
        }
    }

    /// Rebuilds the plan for `spec` and re-checks it against `budget`.
    pub fn translate<C: CostEstimator>(
        &self,
        spec: &ConvShapeSpec,
        budget: &PlatformBudget,
        cost: &C,
        allow_window_tiling: bool,
    ) -> Result<Translated, TranslationError> {
        let unknown = |field, code| TranslationError::UnknownCode { field, code };
        let split = KernelSplitMode::from_code(self.kernel_split)
            .ok_or_else(|| unknown("kernel_split", self.kernel_split))?;
        let mode = SplitMode::from_code(self.split_mode)
            .ok_or_else(|| unknown("split_mode", self.split_mode))?;
        let iter_order = IterOrder::from_code(self.iter_order)
            .ok_or_else(|| unknown("iter_order", self.iter_order))?;
        let load_b1 = LoadB1Condition::from_code(self.load_b1)
            .ok_or_else(|| unknown("load_b1", self.load_b1))?;

        let problem = match split {
            KernelSplitMode::None => spec.problem(),
            mode => split_problem(spec, mode).ok_or(TranslationError::SplitNotApplicable(mode))?,
        };

        let totals = axis_totals(&problem, mode);
        if self.singles.iter().any(|&s| s == 0) {
            return Err(TranslationError::Coverage);
        }
        let [batch, depth, spatial, n, group] = [0, 1, 2, 3, 4]
            .map(|i| AxisSplit::from_single(totals[i].0, self.singles[i]));
        let dims = BlockDims {
            batch,
            depth,
            spatial,
            n,
            group,
        };
        if !dims.covers(&problem, mode) {
            return Err(TranslationError::Coverage);
        }
        let cores = budget.core_count();
        if dims.used_cores() > cores {
            return Err(TranslationError::TooManyCores {
                used: dims.used_cores(),
                cores,
            });
        }
        let block = BlockDimResult {
            mode,
            dims,
            cost: cost.block_dim_cost(&problem, mode, &dims),
        };

        let core = CoreShape::new(&problem, &block);
        if !core.load_b1_modes(allow_window_tiling).contains(&load_b1) {
            return Err(TranslationError::LoadB1(load_b1));
        }
        let tile = TileShape::assemble(
            &core,
            L0Tile {
                spatial: SpatialTile::new(self.ho_l0, self.wo_l0),
                k: self.k_l0,
                n: self.n_l0,
            },
            AL1Tile {
                spatial: SpatialTile::new(self.ho_al1, self.wo_al1),
                k: self.k_al1,
            },
            BL1Tile {
                k: self.k_bl1,
                n: self.n_bl1,
            },
            PingPong::from_flag(self.pbuffer_flag),
            iter_order,
            self.bias_full_load,
            load_b1,
        );
        if [self.ho_l0, self.wo_l0, self.ho_al1, self.wo_al1, self.k_al1, self.k_bl1, self.n_bl1]
            .contains(&0)
            || !tile.is_consistent(&core)
        {
            return Err(TranslationError::Inconsistent);
        }
        if let Some(level) = tile.footprint(&core).first_overflow(&budget.capacity) {
            return Err(TranslationError::Capacity(level));
        }
        Ok(Translated {
            problem,
            block,
            tile,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("repository file is malformed: {0}")]
    Bincode(#[from] bincode::Error),
}

/// Source of tuned plans.
#[auto_impl(&, Box, Rc, Arc)]
pub trait TilingRepository {
    fn query(&self, key: &RepositoryKey) -> Option<TuningResult>;

    /// Stores a searched plan. Returns false for read-only repositories.
    fn record(&self, _key: RepositoryKey, _result: TuningResult) -> bool {
        false
    }
}

/// A repository that never has anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoRepository;

impl TilingRepository for NoRepository {
    fn query(&self, _key: &RepositoryKey) -> Option<TuningResult> {
        None
    }
}

/// An in-memory repository, optionally backed by a compressed file.
#[derive(Debug, Default)]
pub struct KnowledgeRepository {
    entries: DashMap<RepositoryKey, TuningResult>,
    file_path: Option<PathBuf>,
}

impl KnowledgeRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the repository at `path`. A missing file gives an empty repository
    /// which [KnowledgeRepository::save] will create.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RepositoryError> {
        let path = path.as_ref();
        let entries = match std::fs::File::open(path) {
            Ok(f) => {
                let start = Instant::now();
                let decoder = snap::read::FrameDecoder::new(f);
                let entries: DashMap<RepositoryKey, TuningResult> =
                    bincode::deserialize_from(decoder)?;
                debug!("Loading repository took {:?}", start.elapsed());
                info!("Loaded {} tuned plans from {}", entries.len(), path.display());
                entries
            }
            Err(err) => match err.kind() {
                std::io::ErrorKind::NotFound => Default::default(),
                _ => return Err(err.into()),
            },
        };
        Ok(KnowledgeRepository {
            entries,
            file_path: Some(path.to_path_buf()),
        })
    }

    /// Writes back to the file this repository was loaded from, if any.
    pub fn save(&self) -> Result<(), RepositoryError> {
        match &self.file_path {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<(), RepositoryError> {
        let path = path.as_ref();
        let file = std::fs::File::create(path)?;
        let encoder = snap::write::FrameEncoder::new(file);
        let start = Instant::now();
        bincode::serialize_into(encoder, &self.entries)?;
        debug!("Saving repository took {:?}", start.elapsed());
        info!("Saved {} tuned plans to {}", self.entries.len(), path.display());
        Ok(())
    }

    pub fn insert(&self, key: RepositoryKey, result: TuningResult) {
        self.entries.insert(key, result);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl TilingRepository for KnowledgeRepository {
    fn query(&self, key: &RepositoryKey) -> Option<TuningResult> {
        self.entries.get(key).map(|r| r.value().clone())
    }

    fn record(&self, key: RepositoryKey, result: TuningResult) -> bool {
        self.insert(key, result);
        true
    }
}
