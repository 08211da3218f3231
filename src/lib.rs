pub mod blob;
pub mod blockdim;
pub mod cache;
pub mod common;
pub mod cost;
pub mod error;
pub mod kernelsplit;
pub mod memorylimits;
pub mod orchestrator;
pub mod pprint;
pub mod repository;
pub mod search;
pub mod shape;
pub mod target;
pub mod template;
pub mod tiling;
pub mod utils;
pub mod validate;

pub use error::TilingError;
pub use orchestrator::{Plan, PlannerConfig, TilingOrchestrator, TilingResult};
pub use shape::{ConvBuilder, ConvRequest};
pub use target::{PlatformBudget, TargetId};
