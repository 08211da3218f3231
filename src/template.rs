//! Execution template selection and its dispatch key.
//!
//! Legal flag combinations are the variants of [Template]; everything else is
//! rejected when a [Template] is built from [TemplateFlags] or decoded from a key.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::kernelsplit::KernelSplitMode;
use crate::shape::{ConvProblem, ConvShapeSpec, GroupMode};
use crate::tiling::{LoadB1Condition, TileShape};

const FIELD_BITS: u32 = 8;
const FIELD_COUNT: u32 = 5;

/// How the weight is moved from L1 into L0B.
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
pub enum LoadB2Condition {
    /// One L0 K tile holds part of a kernel window.
    PartialWindow,
    /// Each L0 K tile holds whole kernel windows.
    FullWindow,
    /// 1x1 kernel; no window handling at all.
    UnitKernel,
    /// Channel-last weight, transposed on load.
    Transpose,
}

impl LoadB2Condition {
    pub fn code(&self) -> u8 {
        match self {
            LoadB2Condition::PartialWindow => 0,
            LoadB2Condition::FullWindow => 1,
            LoadB2Condition::UnitKernel => 2,
            LoadB2Condition::Transpose => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(LoadB2Condition::PartialWindow),
            1 => Some(LoadB2Condition::FullWindow),
            2 => Some(LoadB2Condition::UnitKernel),
            3 => Some(LoadB2Condition::Transpose),
            _ => None,
        }
    }
}

/// Every input of template selection.
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
pub struct TemplateFlags {
    pub load_b2: LoadB2Condition,
    pub kernel_split: KernelSplitMode,
    pub group: GroupMode,
    pub basic_block: bool,
    pub load_b1: LoadB1Condition,
}

impl TemplateFlags {
    /// Flags of a finished plan.
    ///
    /// The weight-load condition looks at the kernel as declared, before any split.
    pub fn resolve(
        spec: &ConvShapeSpec,
        problem: &ConvProblem,
        tile: &TileShape,
        basic_block: bool,
    ) -> Self {
        let window = spec.kernel.h * spec.kernel.w;
        let load_b2 = if window == 1 {
            LoadB2Condition::UnitKernel
        } else if spec.weight_format.is_channel_last() {
            LoadB2Condition::Transpose
        } else if tile.l0.k / problem.cube().k0 >= problem.kernel.h * problem.kernel.w {
            LoadB2Condition::FullWindow
        } else {
            LoadB2Condition::PartialWindow
        };
        TemplateFlags {
            load_b2,
            kernel_split: problem.kernel_split,
            group: problem.group_mode,
            basic_block,
            load_b1: tile.load_b1,
        }
    }
}

impl fmt::Display for TemplateFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:?}, {}, {}, basic_block={}, {})",
            self.load_b2, self.kernel_split, self.group, self.basic_block, self.load_b1
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("no template for {flags}: {reason}")]
    Illegal {
        flags: TemplateFlags,
        reason: &'static str,
    },
    #[error("malformed dispatch key {0:#x}")]
    MalformedKey(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum SplitKind {
    H,
    Hw,
}

/// One legal execution template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Template {
    /// Greedy L0 tiles, streamed or full-loaded operands.
    Streamed {
        load_b2: LoadB2Condition,
        group: GroupMode,
        load_b1: LoadB1Condition,
    },
    /// Fixed basic-block L0 tiles.
    BasicBlock {
        load_b2: LoadB2Condition,
        group: GroupMode,
        load_b1: LoadB1Condition,
    },
    /// Backprop input executed as strided sub-kernel phases on basic blocks.
    KernelSplit {
        load_b2: LoadB2Condition,
        split: SplitKind,
        load_b1: LoadB1Condition,
    },
}

impl TryFrom<TemplateFlags> for Template {
    type Error = TemplateError;

    fn try_from(flags: TemplateFlags) -> Result<Self, Self::Error> {
        let illegal = |reason| Err(TemplateError::Illegal { flags, reason });
        let TemplateFlags {
            load_b2,
            kernel_split,
            group,
            basic_block,
            load_b1,
        } = flags;

        let split = match kernel_split {
            KernelSplitMode::None => None,
            KernelSplitMode::SplitH => Some(SplitKind::H),
            KernelSplitMode::SplitHw => Some(SplitKind::Hw),
        };
        if let Some(split) = split {
            if group != GroupMode::Normal {
                return illegal("kernel split needs an ungrouped convolution");
            }
            if !basic_block {
                return illegal("kernel split runs on basic blocks only");
            }
            if load_b2 == LoadB2Condition::UnitKernel {
                return illegal("a unit kernel has nothing to split");
            }
            if load_b1 == LoadB1Condition::C04 {
                return illegal("C04 packing is forward only");
            }
            return Ok(Template::KernelSplit {
                load_b2,
                split,
                load_b1,
            });
        }

        if load_b1 == LoadB1Condition::C04 && group != GroupMode::Normal {
            return illegal("C04 packing needs an ungrouped convolution");
        }
        if group == GroupMode::Enlarged && load_b1 != LoadB1Condition::Full {
            return illegal("enlarged groups load whole kernel windows");
        }
        Ok(if basic_block {
            Template::BasicBlock {
                load_b2,
                group,
                load_b1,
            }
        } else {
            Template::Streamed {
                load_b2,
                group,
                load_b1,
            }
        })
    }
}

impl Template {
    pub fn flags(&self) -> TemplateFlags {
        match *self {
            Template::Streamed {
                load_b2,
                group,
                load_b1,
            } => TemplateFlags {
                load_b2,
                kernel_split: KernelSplitMode::None,
                group,
                basic_block: false,
                load_b1,
            },
            Template::BasicBlock {
                load_b2,
                group,
                load_b1,
            } => TemplateFlags {
                load_b2,
                kernel_split: KernelSplitMode::None,
                group,
                basic_block: true,
                load_b1,
            },
            Template::KernelSplit {
                load_b2,
                split,
                load_b1,
            } => TemplateFlags {
                load_b2,
                kernel_split: match split {
                    SplitKind::H => KernelSplitMode::SplitH,
                    SplitKind::Hw => KernelSplitMode::SplitHw,
                },
                group: GroupMode::Normal,
                basic_block: true,
                load_b1,
            },
        }
    }

    /// Packs the flags one byte each: load_b2, kernel split, group, basic block, load_b1.
    pub fn dispatch_key(&self) -> u64 {
        let f = self.flags();
        [
            f.load_b2.code(),
            f.kernel_split.code(),
            f.group.code(),
            u8::from(f.basic_block),
            f.load_b1.code(),
        ]
        .iter()
        .enumerate()
        .fold(0, |key, (i, &b)| key | (u64::from(b) << (FIELD_BITS * i as u32)))
    }

    pub fn from_dispatch_key(key: u64) -> Result<Self, TemplateError> {
        let malformed = || TemplateError::MalformedKey(key);
        if key >> (FIELD_BITS * FIELD_COUNT) != 0 {
            return Err(malformed());
        }
        let byte = |i: u32| (key >> (FIELD_BITS * i)) as u8;
        let flags = TemplateFlags {
            load_b2: LoadB2Condition::from_code(byte(0)).ok_or_else(malformed)?,
            kernel_split: KernelSplitMode::from_code(byte(1)).ok_or_else(malformed)?,
            group: GroupMode::from_code(byte(2)).ok_or_else(malformed)?,
            basic_block: match byte(3) {
                0 => false,
                1 => true,
                _ => return Err(malformed()),
            },
            load_b1: LoadB1Condition::from_code(byte(4)).ok_or_else(malformed)?,
        };
        Template::try_from(flags)
    }

    /// Every legal template.
    pub fn all() -> impl Iterator<Item = Template> {
        enum_iterator::all::<TemplateFlags>().filter_map(|f| Template::try_from(f).ok())
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Template::Streamed { .. } => write!(f, "streamed")?,
            Template::BasicBlock { .. } => write!(f, "basic-block")?,
            Template::KernelSplit { split, .. } => write!(f, "kernel-split-{:?}", split)?,
        }
        write!(f, " {}", self.flags())
    }
}

/// Resolves the template of a finished plan.
pub fn select(
    spec: &ConvShapeSpec,
    problem: &ConvProblem,
    tile: &TileShape,
    basic_block: bool,
) -> Result<Template, TemplateError> {
    let flags = TemplateFlags::resolve(spec, problem, tile, basic_block);
    let template = Template::try_from(flags)?;
    log::debug!("Template {} key {:#x}", template, template.dispatch_key());
    Ok(template)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_every_accepted_tuple_roundtrips() {
        let mut accepted = 0;
        let mut rejected = 0;
        for flags in enum_iterator::all::<TemplateFlags>() {
            match Template::try_from(flags) {
                Ok(template) => {
                    accepted += 1;
                    assert_eq!(template.flags(), flags);
                    let decoded = Template::from_dispatch_key(template.dispatch_key()).unwrap();
                    assert_eq!(decoded, template);
                }
                Err(TemplateError::Illegal { .. }) => rejected += 1,
                Err(e) => panic!("unexpected {e}"),
            }
        }
        assert!(accepted > 0);
        assert!(rejected > 0);
        assert_eq!(Template::all().count(), accepted);
    }

    #[test]
    fn test_kernel_split_requires_basic_block() {
        let flags = TemplateFlags {
            load_b2: LoadB2Condition::FullWindow,
            kernel_split: KernelSplitMode::SplitHw,
            group: GroupMode::Normal,
            basic_block: false,
            load_b1: LoadB1Condition::TilingHkWk,
        };
        assert!(matches!(
            Template::try_from(flags),
            Err(TemplateError::Illegal { .. })
        ));
        let ok = TemplateFlags {
            basic_block: true,
            ..flags
        };
        assert_eq!(
            Template::try_from(ok),
            Ok(Template::KernelSplit {
                load_b2: LoadB2Condition::FullWindow,
                split: SplitKind::Hw,
                load_b1: LoadB1Condition::TilingHkWk,
            })
        );
    }

    #[test]
    fn test_grouped_kernel_split_is_illegal() {
        let flags = TemplateFlags {
            load_b2: LoadB2Condition::PartialWindow,
            kernel_split: KernelSplitMode::SplitH,
            group: GroupMode::Original,
            basic_block: true,
            load_b1: LoadB1Condition::Full,
        };
        assert!(Template::try_from(flags).is_err());
    }

    #[test]
    fn test_key_layout() {
        let t = Template::BasicBlock {
            load_b2: LoadB2Condition::Transpose,
            group: GroupMode::Original,
            load_b1: LoadB1Condition::TilingHk,
        };
        assert_eq!(t.dispatch_key(), 0x02_01_01_00_03);
    }

    proptest! {
        #[test]
        fn test_decoded_keys_reencode_exactly(key in any::<u64>()) {
            if let Ok(template) = Template::from_dispatch_key(key) {
                prop_assert_eq!(template.dispatch_key(), key);
            }
        }

        #[test]
        fn test_near_legal_keys_reencode_exactly(bytes in proptest::array::uniform5(0u8..5)) {
            let key = bytes
                .iter()
                .enumerate()
                .fold(0u64, |k, (i, &b)| k | (u64::from(b) << (8 * i)));
            if let Ok(template) = Template::from_dispatch_key(key) {
                prop_assert_eq!(template.dispatch_key(), key);
            }
        }

        #[test]
        fn test_try_from_never_coerces(flags in any::<TemplateFlags>()) {
            if let Ok(template) = Template::try_from(flags) {
                prop_assert_eq!(template.flags(), flags);
            }
        }
    }
}
