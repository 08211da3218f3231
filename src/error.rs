use crate::blob::BlobError;
use crate::target::MemoryLevel;
use crate::template::TemplateError;
use crate::validate::ValidationError;

/// Why no tiling exists for a problem.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Infeasibility {
    #[error("no core assignment admits a minimal tile")]
    BlockDim,
    #[error("minimal tile needs {needed} bytes of {level}, only {capacity} available")]
    Capacity {
        level: MemoryLevel,
        needed: u64,
        capacity: u64,
    },
    #[error("no kernel split applies")]
    NoKernelSplit,
}

#[derive(Debug, thiserror::Error)]
pub enum TilingError {
    #[error("invalid shape: {0}")]
    InvalidShape(#[from] ValidationError),
    #[error("infeasible: {0}")]
    Infeasible(Infeasibility),
    #[error("template selection failed: {0}")]
    TemplateSelection(#[from] TemplateError),
    #[error("serialization failed: {0}")]
    Serialize(#[from] BlobError),
}

impl TilingError {
    pub fn is_infeasible(&self) -> bool {
        matches!(self, TilingError::Infeasible(_))
    }
}

impl From<Infeasibility> for TilingError {
    fn from(value: Infeasibility) -> Self {
        TilingError::Infeasible(value)
    }
}
