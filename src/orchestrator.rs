//! The planning pipeline for one convolution request.
//!
//! ```text
//! Init -> ValidateShapes -> CacheHit -----------------------------------------> Done
//!                        -> RepoHit ---------> ResolveTemplateKey -> Serialize -> Done
//!                        -> FastTilingSearch -> ResolveTemplateKey -> Serialize -> Done
//!                           (-> KernelSplit -> FastTilingSearch on infeasibility)
//! ```
//!
//! Any error moves to `Failed`. A result is cached only once it is fully serialized.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::blob::TilingData;
use crate::blockdim::{BlockDimDecision, BlockDimResult};
use crate::cache::{CacheKey, TilingCache};
use crate::cost::{CostCoefficients, CostEstimator, TrafficCostModel};
use crate::error::{Infeasibility, TilingError};
use crate::kernelsplit::{applicable_split, split_problem, KernelSplitMode};
use crate::repository::{NoRepository, RepositoryKey, TilingRepository, TuningResult};
use crate::search::{SearchConfig, TileShapeSearch};
use crate::shape::{ConvProblem, ConvRequest, ConvShapeSpec};
use crate::target::PlatformBudget;
use crate::template::{self, Template};
use crate::tiling::TileShape;
use crate::validate::validate;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlannerConfig {
    pub use_cache: bool,
    pub use_repository: bool,
    /// Write searched plans into the repository.
    pub record: bool,
    pub search: SearchConfig,
    pub coefficients: CostCoefficients,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        PlannerConfig {
            use_cache: true,
            use_repository: true,
            record: false,
            search: SearchConfig::default(),
            coefficients: CostCoefficients::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PlannerStats {
    pub validations: AtomicU64,
    pub block_dim_runs: AtomicU64,
    pub searches: AtomicU64,
    pub kernel_split_escalations: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_rejections: AtomicU64,
    pub repository_hits: AtomicU64,
}

impl PlannerStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    ValidateShapes,
    CacheHit,
    RepoHit,
    FastTilingSearch,
    KernelSplit,
    ResolveTemplateKey,
    Serialize,
    Done,
    Failed,
}

pub type Trace = SmallVec<[Stage; 8]>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PlanSource {
    Cache,
    Repository,
    Search,
}

impl fmt::Display for PlanSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanSource::Cache => write!(f, "cache"),
            PlanSource::Repository => write!(f, "repository"),
            PlanSource::Search => write!(f, "search"),
        }
    }
}

/// A complete plan. Immutable once built; shared through the cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TilingResult {
    pub spec: ConvShapeSpec,
    /// The problem actually tiled: a single kernel-split phase when `problem.kernel_split` is set.
    pub problem: ConvProblem,
    pub block: BlockDimResult,
    pub tile: TileShape,
    pub template: Template,
    pub dispatch_key: u64,
    pub data: TilingData,
    pub blob: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct Plan {
    pub result: Arc<TilingResult>,
    pub source: PlanSource,
    pub trace: Trace,
}

struct Planned {
    problem: ConvProblem,
    block: BlockDimResult,
    tile: TileShape,
}

pub struct TilingOrchestrator<R = NoRepository, C = TrafficCostModel> {
    budget: PlatformBudget,
    config: PlannerConfig,
    cache: Arc<TilingCache>,
    repository: R,
    cost: C,
    stats: Arc<PlannerStats>,
}

impl TilingOrchestrator {
    /// An orchestrator on the process-wide cache, without a repository.
    pub fn new(budget: &PlatformBudget) -> Self {
        Self::with_config(budget, PlannerConfig::default())
    }

    pub fn with_config(budget: &PlatformBudget, config: PlannerConfig) -> Self {
        TilingOrchestrator {
            budget: budget.clone(),
            config,
            cache: TilingCache::global(),
            repository: NoRepository,
            cost: TrafficCostModel::new(config.coefficients),
            stats: Default::default(),
        }
    }
}

impl<R, C> TilingOrchestrator<R, C> {
    pub fn with_cache(mut self, cache: Arc<TilingCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_stats(mut self, stats: Arc<PlannerStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_repository<R2: TilingRepository>(self, repository: R2) -> TilingOrchestrator<R2, C> {
        TilingOrchestrator {
            budget: self.budget,
            config: self.config,
            cache: self.cache,
            repository,
            cost: self.cost,
            stats: self.stats,
        }
    }

    pub fn with_cost<C2: CostEstimator>(self, cost: C2) -> TilingOrchestrator<R, C2> {
        TilingOrchestrator {
            budget: self.budget,
            config: self.config,
            cache: self.cache,
            repository: self.repository,
            cost,
            stats: self.stats,
        }
    }

    pub fn budget(&self) -> &PlatformBudget {
        &self.budget
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<TilingCache> {
        &self.cache
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub fn stats(&self) -> &PlannerStats {
        &self.stats
    }
}

impl<R: TilingRepository, C: CostEstimator> TilingOrchestrator<R, C> {
    pub fn plan(&self, request: &ConvRequest) -> Result<Plan, TilingError> {
        let mut trace = Trace::new();
        trace.push(Stage::Init);
        match self.run(request, &mut trace) {
            Ok((result, source)) => {
                trace.push(Stage::Done);
                Ok(Plan {
                    result,
                    source,
                    trace,
                })
            }
            Err(err) => {
                trace.push(Stage::Failed);
                debug!("Planning failed after {:?}: {}", trace.as_slice(), err);
                Err(err)
            }
        }
    }

    fn run(
        &self,
        request: &ConvRequest,
        trace: &mut Trace,
    ) -> Result<(Arc<TilingResult>, PlanSource), TilingError> {
        trace.push(Stage::ValidateShapes);
        PlannerStats::bump(&self.stats.validations);
        let spec = validate(request, &self.budget.limits)?;
        debug!("Validated {}", spec);

        let key = CacheKey {
            spec: spec.clone(),
            platform: self.budget.clone(),
            search: self.config.search,
            use_repository: self.config.use_repository,
            cost_fingerprint: self.cost.fingerprint(),
        };
        if self.config.use_cache {
            if let Some(result) = self.cache.get(&key) {
                trace.push(Stage::CacheHit);
                PlannerStats::bump(&self.stats.cache_hits);
                return Ok((result, PlanSource::Cache));
            }
        }

        let repo_key = RepositoryKey::new(&spec, self.config.search, &self.budget);
        let (planned, source) = match self.from_repository(&spec, &repo_key) {
            Some(planned) => {
                trace.push(Stage::RepoHit);
                PlannerStats::bump(&self.stats.repository_hits);
                (planned, PlanSource::Repository)
            }
            None => {
                let planned = self.search(&spec, trace)?;
                if self.config.use_repository && self.config.record {
                    let stored = TuningResult::from_plan(&planned.problem, &planned.block, &planned.tile);
                    self.repository.record(repo_key, stored);
                }
                (planned, PlanSource::Search)
            }
        };

        trace.push(Stage::ResolveTemplateKey);
        let basic_block =
            self.config.search.basic_block || planned.problem.kernel_split != KernelSplitMode::None;
        let template = template::select(&spec, &planned.problem, &planned.tile, basic_block)?;

        trace.push(Stage::Serialize);
        let data = TilingData::new(&spec, &planned.problem, &planned.block, &planned.tile, &template)?;
        let blob = data.encode()?;

        let result = Arc::new(TilingResult {
            spec,
            problem: planned.problem,
            block: planned.block,
            tile: planned.tile,
            dispatch_key: template.dispatch_key(),
            template,
            data,
            blob,
        });
        if self.config.use_cache && !self.cache.put(key, Arc::clone(&result)) {
            PlannerStats::bump(&self.stats.cache_rejections);
        }
        Ok((result, source))
    }

    fn from_repository(&self, spec: &ConvShapeSpec, key: &RepositoryKey) -> Option<Planned> {
        if !self.config.use_repository {
            return None;
        }
        let stored = self.repository.query(key)?;
        match stored.translate(
            spec,
            &self.budget,
            &self.cost,
            self.config.search.allow_window_tiling,
        ) {
            Ok(t) => Some(Planned {
                problem: t.problem,
                block: t.block,
                tile: t.tile,
            }),
            Err(err) => {
                warn!("Discarding tuned plan for {}: {}", spec, err);
                None
            }
        }
    }

    /// Searches the problem as given, then once more under a kernel split if it is infeasible.
    fn search(&self, spec: &ConvShapeSpec, trace: &mut Trace) -> Result<Planned, TilingError> {
        trace.push(Stage::FastTilingSearch);
        let problem = spec.problem();
        let err = match self.search_problem(problem) {
            Ok(planned) => return Ok(planned),
            Err(err) if err.is_infeasible() && self.config.search.kernel_split => err,
            Err(err) => return Err(err),
        };

        trace.push(Stage::KernelSplit);
        PlannerStats::bump(&self.stats.kernel_split_escalations);
        let mode = applicable_split(spec);
        let Some(split) = split_problem(spec, mode) else {
            debug!("No kernel split for {}: {}", spec, err);
            return Err(Infeasibility::NoKernelSplit.into());
        };
        debug!("Retrying with kernel split {} after: {}", mode, err);
        trace.push(Stage::FastTilingSearch);
        self.search_problem(split)
    }

    fn search_problem(&self, problem: ConvProblem) -> Result<Planned, TilingError> {
        PlannerStats::bump(&self.stats.block_dim_runs);
        let block = BlockDimDecision::new(&self.budget, &self.cost)
            .allow_window_tiling(self.config.search.allow_window_tiling)
            .decide(&problem)?;
        PlannerStats::bump(&self.stats.searches);
        let tile = TileShapeSearch::new(&self.budget, &self.cost, self.config.search)
            .search(&problem, &block)?;
        Ok(Planned {
            problem,
            block,
            tile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockdim::SplitMode;
    use crate::repository::KnowledgeRepository;
    use crate::shape::ConvBuilder;
    use crate::target::{MemoryLevel, TargetId};
    use crate::template::SplitKind;
    use crate::tiling::CoreShape;
    use crate::validate::ValidationError;
    use proptest::prelude::*;

    fn planner(budget: &PlatformBudget) -> TilingOrchestrator {
        TilingOrchestrator::new(budget).with_cache(Arc::new(TilingCache::default()))
    }

    fn strided_backprop_small_l1() -> (PlatformBudget, ConvRequest) {
        let budget = PlatformBudget::for_target(TargetId::Cube32)
            .clone()
            .with_capacity(MemoryLevel::L1, 2112);
        let request = ConvBuilder::backprop_input(1, 256, 256, [1, 34, 34], [1, 3, 3])
            .stride([1, 2, 2])
            .build();
        (budget, request)
    }

    #[test]
    fn test_forward_3x3_on_32_cores() {
        let budget = PlatformBudget::for_target(TargetId::Cube32);
        let request = ConvBuilder::forward(1, 256, 256, [1, 34, 34], [1, 3, 3]).build();
        let plan = planner(budget).plan(&request).unwrap();
        let r = &plan.result;
        assert_eq!(plan.source, PlanSource::Search);
        assert_eq!(r.block.dims.batch.dim, 1);
        assert!(r.block.used_cores() > 1);
        assert!(r.block.used_cores() <= budget.core_count());
        assert_eq!(r.problem.kernel_split, KernelSplitMode::None);
        assert!(!plan.trace.contains(&Stage::KernelSplit));
        assert!(matches!(r.template, Template::Streamed { .. }));
        let core = CoreShape::new(&r.problem, &r.block);
        assert!(r.tile.fits(&core, budget));
        assert_eq!(
            plan.trace.as_slice(),
            &[
                Stage::Init,
                Stage::ValidateShapes,
                Stage::FastTilingSearch,
                Stage::ResolveTemplateKey,
                Stage::Serialize,
                Stage::Done
            ]
        );
    }

    #[test]
    fn test_strided_backprop_escalates_to_kernel_split() {
        let (budget, request) = strided_backprop_small_l1();
        let orchestrator = planner(&budget);
        let plan = orchestrator.plan(&request).unwrap();
        let r = &plan.result;
        assert_eq!(r.problem.kernel_split, KernelSplitMode::SplitHw);
        assert_eq!(
            r.template,
            Template::KernelSplit {
                load_b2: r.template.flags().load_b2,
                split: SplitKind::Hw,
                load_b1: r.tile.load_b1,
            }
        );
        assert!(plan.trace.contains(&Stage::KernelSplit));
        assert_eq!(
            PlannerStats::get(&orchestrator.stats().kernel_split_escalations),
            1
        );
        assert_eq!(r.data.kernel_split, KernelSplitMode::SplitHw.code());
        assert_eq!(r.data.phases, 4);
        let core = CoreShape::new(&r.problem, &r.block);
        assert!(r.tile.fits(&core, &budget));
    }

    #[test]
    fn test_escalation_is_fatal_without_applicable_split() {
        let budget = PlatformBudget::for_target(TargetId::Cube32)
            .clone()
            .with_capacity(MemoryLevel::L1, 1024);
        let request = ConvBuilder::forward(1, 256, 256, [1, 34, 34], [1, 3, 3]).build();
        let err = planner(&budget).plan(&request).unwrap_err();
        assert!(matches!(
            err,
            TilingError::Infeasible(Infeasibility::NoKernelSplit)
        ));
    }

    #[test]
    fn test_disabled_kernel_split_reports_original_infeasibility() {
        let (budget, request) = strided_backprop_small_l1();
        let config = PlannerConfig {
            search: SearchConfig {
                kernel_split: false,
                ..SearchConfig::default()
            },
            ..PlannerConfig::default()
        };
        let err = TilingOrchestrator::with_config(&budget, config)
            .with_cache(Arc::new(TilingCache::default()))
            .plan(&request)
            .unwrap_err();
        assert!(err.is_infeasible());
    }

    #[test]
    fn test_second_identical_call_hits_cache() {
        let budget = PlatformBudget::for_target(TargetId::Cube24);
        let request = ConvBuilder::forward(2, 32, 64, [1, 28, 28], [1, 3, 3]).build();
        let orchestrator = planner(budget);
        let first = orchestrator.plan(&request).unwrap();
        let second = orchestrator.plan(&request).unwrap();
        assert_eq!(first.source, PlanSource::Search);
        assert_eq!(second.source, PlanSource::Cache);
        assert!(Arc::ptr_eq(&first.result, &second.result));
        assert_eq!(PlannerStats::get(&orchestrator.stats().searches), 1);
        assert_eq!(PlannerStats::get(&orchestrator.stats().cache_hits), 1);
        assert_eq!(
            second.trace.as_slice(),
            &[Stage::Init, Stage::ValidateShapes, Stage::CacheHit, Stage::Done]
        );
    }

    #[test]
    fn test_zero_co_fails_before_block_dims() {
        let budget = PlatformBudget::for_target(TargetId::Cube32);
        let request = ConvBuilder::forward(1, 16, 0, [1, 8, 8], [1, 3, 3]).build();
        let orchestrator = planner(budget);
        let err = orchestrator.plan(&request).unwrap_err();
        assert!(matches!(
            err,
            TilingError::InvalidShape(ValidationError::NonPositive { ref field, value: 0 })
                if field == "co"
        ));
        assert_eq!(PlannerStats::get(&orchestrator.stats().block_dim_runs), 0);
        assert_eq!(orchestrator.cache().len(), 0);
    }

    #[test]
    fn test_full_cache_still_plans() {
        let budget = PlatformBudget::for_target(TargetId::Cube32);
        let orchestrator =
            TilingOrchestrator::new(budget).with_cache(Arc::new(TilingCache::new(1)));
        let a = ConvBuilder::forward(1, 16, 16, [1, 8, 8], [1, 3, 3]).build();
        let b = ConvBuilder::forward(1, 32, 16, [1, 8, 8], [1, 3, 3]).build();
        orchestrator.plan(&a).unwrap();
        assert_eq!(orchestrator.plan(&b).unwrap().source, PlanSource::Search);
        assert_eq!(PlannerStats::get(&orchestrator.stats().cache_rejections), 1);
        assert_eq!(orchestrator.plan(&b).unwrap().source, PlanSource::Search);
    }

    #[test]
    fn test_repository_hit_skips_search_and_is_cached() {
        let budget = PlatformBudget::for_target(TargetId::Cube32);
        let request = ConvBuilder::forward(1, 64, 128, [1, 20, 20], [1, 3, 3]).build();
        let repository = Arc::new(KnowledgeRepository::new());
        let recording = PlannerConfig {
            record: true,
            use_cache: false,
            ..PlannerConfig::default()
        };
        let searched = TilingOrchestrator::with_config(budget, recording)
            .with_repository(Arc::clone(&repository))
            .plan(&request)
            .unwrap();
        assert_eq!(searched.source, PlanSource::Search);
        assert_eq!(repository.len(), 1);

        let orchestrator = planner(budget).with_repository(Arc::clone(&repository));
        let hit = orchestrator.plan(&request).unwrap();
        assert_eq!(hit.source, PlanSource::Repository);
        assert_eq!(PlannerStats::get(&orchestrator.stats().searches), 0);
        assert_eq!(hit.result.as_ref(), searched.result.as_ref());
        assert_eq!(orchestrator.plan(&request).unwrap().source, PlanSource::Cache);
    }

    #[test]
    fn test_unusable_repository_entry_falls_back_to_search() {
        let budget = PlatformBudget::for_target(TargetId::Cube32);
        let request = ConvBuilder::forward(1, 64, 128, [1, 20, 20], [1, 3, 3]).build();
        let spec = validate(&request, &budget.limits).unwrap();
        let repository = KnowledgeRepository::new();
        let searched = planner(budget).plan(&request).unwrap();
        let r = &searched.result;
        let mut bad = TuningResult::from_plan(&r.problem, &r.block, &r.tile);
        bad.split_mode = SplitMode::Hw.code() + 7;
        repository.insert(RepositoryKey::new(&spec, SearchConfig::default(), budget), bad);

        let orchestrator = planner(budget).with_repository(repository);
        let plan = orchestrator.plan(&request).unwrap();
        assert_eq!(plan.source, PlanSource::Search);
        assert_eq!(plan.result.as_ref(), searched.result.as_ref());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn test_cache_never_changes_results(
            batch in 1i64..4,
            ci in prop::sample::select(vec![3i64, 16, 48, 96]),
            co in prop::sample::select(vec![16i64, 40, 128]),
            hw in 6i64..40,
            k in 1i64..4,
            target in any::<TargetId>(),
        ) {
            let budget = PlatformBudget::for_target(target);
            let request = ConvBuilder::forward(batch, ci, co, [1, hw, hw], [1, k, k]).build();
            let uncached = TilingOrchestrator::with_config(
                budget,
                PlannerConfig { use_cache: false, ..PlannerConfig::default() },
            )
            .plan(&request);
            let cached = planner(budget);
            let first = cached.plan(&request);
            let second = cached.plan(&request);
            match (uncached, first, second) {
                (Ok(u), Ok(f), Ok(s)) => {
                    prop_assert_eq!(u.result.as_ref(), f.result.as_ref());
                    prop_assert_eq!(f.result.as_ref(), s.result.as_ref());
                    prop_assert_eq!(s.source, PlanSource::Cache);
                }
                (Err(_), Err(_), Err(_)) => {}
                (u, f, s) => prop_assert!(false, "diverged: {:?} {:?} {:?}", u.is_ok(), f.is_ok(), s.is_ok()),
            }
        }
    }
}
