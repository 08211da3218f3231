//! Kernel splitting for strided backprop input.
//!
//! With stride `s`, output-gradient rows of the same phase modulo `s` only ever
//! meet kernel taps of one residue class. Splitting the kernel by residue turns one
//! convolution over the stride-dilated gradient into `s` (per split axis) stride-1
//! convolutions over the un-dilated gradient, each with a kernel of `ceil(k / s)` taps.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::{ConvOp, DimSize, Dims3};
use crate::shape::{ConvProblem, ConvShapeSpec, Pads};
use crate::utils::ceil_div;

const SPLIT_STRIDE: DimSize = 2;
const MAX_SPLIT_H_KERNEL: DimSize = 16;

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
pub enum KernelSplitMode {
    None,
    /// Split along both H and W into four sub-kernels.
    SplitHw,
    /// Split along H into two sub-kernels.
    SplitH,
}

impl KernelSplitMode {
    pub fn code(&self) -> u8 {
        match self {
            KernelSplitMode::None => 0,
            KernelSplitMode::SplitHw => 1,
            KernelSplitMode::SplitH => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(KernelSplitMode::None),
            1 => Some(KernelSplitMode::SplitHw),
            2 => Some(KernelSplitMode::SplitH),
            _ => None,
        }
    }

    pub fn sub_kernels(&self) -> DimSize {
        match self {
            KernelSplitMode::None => 1,
            KernelSplitMode::SplitHw => SPLIT_STRIDE * SPLIT_STRIDE,
            KernelSplitMode::SplitH => SPLIT_STRIDE,
        }
    }
}

impl fmt::Display for KernelSplitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelSplitMode::None => write!(f, "none"),
            KernelSplitMode::SplitHw => write!(f, "split-hw"),
            KernelSplitMode::SplitH => write!(f, "split-h"),
        }
    }
}

/// The kernel split usable for `spec`, or [KernelSplitMode::None].
pub fn applicable_split(spec: &ConvShapeSpec) -> KernelSplitMode {
    if spec.op != ConvOp::BackpropInput
        || spec.groups != 1
        || spec.dilation.h != 1
        || spec.dilation.w != 1
        || spec.pads.top != spec.pads.bottom
        || spec.pads.left != spec.pads.right
    {
        return KernelSplitMode::None;
    }
    let Dims3 { h: kh, w: kw, .. } = spec.kernel;
    let Dims3 { h: sh, w: sw, .. } = spec.stride;
    if sh == SPLIT_STRIDE && sw == SPLIT_STRIDE && kh == kw && (2..=4).contains(&kh) {
        KernelSplitMode::SplitHw
    } else if sh == SPLIT_STRIDE && (2..=MAX_SPLIT_H_KERNEL).contains(&kh) {
        KernelSplitMode::SplitH
    } else {
        KernelSplitMode::None
    }
}

/// One phase of the split convolution, as a stride-1 problem over the un-dilated gradient.
///
/// Returns `None` for [KernelSplitMode::None].
pub fn split_problem(spec: &ConvShapeSpec, mode: KernelSplitMode) -> Option<ConvProblem> {
    if mode == KernelSplitMode::None {
        return None;
    }
    let mut problem = spec.problem();
    let bp_pads = problem.pads;

    let (kh, in_h, out_h, top, bottom) = split_axis(
        spec.kernel.h,
        spec.stride.h,
        spec.output.h,
        spec.input.h,
        bp_pads.top,
    );
    let (kw, in_w, out_w, left, right) = if mode == KernelSplitMode::SplitHw {
        split_axis(
            spec.kernel.w,
            spec.stride.w,
            spec.output.w,
            spec.input.w,
            bp_pads.left,
        )
    } else {
        (
            problem.kernel.w,
            problem.input.w,
            problem.output.w,
            bp_pads.left,
            bp_pads.right,
        )
    };

    problem.kernel = Dims3::new(problem.kernel.d, kh, kw);
    problem.input = Dims3::new(problem.input.d, in_h, in_w);
    problem.output = Dims3::new(problem.output.d, out_h, out_w);
    problem.pads = Pads {
        top,
        bottom,
        left,
        right,
        ..bp_pads
    };
    problem.kernel_split = mode;
    problem.phases = mode.sub_kernels();
    Some(problem)
}

/// Returns (sub-kernel, input, output, pad head, pad tail) along one split axis.
fn split_axis(
    kernel: DimSize,
    stride: DimSize,
    gradient: DimSize,
    produced: DimSize,
    bp_head: DimSize,
) -> (DimSize, DimSize, DimSize, DimSize, DimSize) {
    let sub_kernel = ceil_div(kernel, stride);
    let sub_output = ceil_div(produced, stride);
    let total_pad = (sub_output + sub_kernel - 1).saturating_sub(gradient);
    let head = (bp_head / stride).min(total_pad);
    (sub_kernel, gradient, sub_output, head, total_pad - head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::ConvBuilder;
    use crate::target::PlatformBudget;
    use crate::validate::validate;

    fn spec(builder: ConvBuilder) -> ConvShapeSpec {
        let limits = PlatformBudget::catalog()[0].limits;
        validate(&builder.build(), &limits).unwrap()
    }

    #[test]
    fn test_stride2_3x3_splits_hw() {
        let s = spec(ConvBuilder::backprop_input(1, 256, 256, [1, 34, 34], [1, 3, 3]).stride([1, 2, 2]));
        assert_eq!(applicable_split(&s), KernelSplitMode::SplitHw);
    }

    #[test]
    fn test_stride2_h_only_splits_h() {
        let s = spec(ConvBuilder::backprop_input(1, 16, 16, [1, 20, 20], [1, 5, 3]).stride([1, 2, 1]));
        assert_eq!(applicable_split(&s), KernelSplitMode::SplitH);
    }

    #[test]
    fn test_forward_never_splits() {
        let s = spec(ConvBuilder::forward(1, 16, 16, [1, 20, 20], [1, 3, 3]).stride([1, 2, 2]));
        assert_eq!(applicable_split(&s), KernelSplitMode::None);
        assert!(split_problem(&s, KernelSplitMode::None).is_none());
    }

    #[test]
    fn test_dilated_backprop_does_not_split() {
        let s = spec(
            ConvBuilder::backprop_input(1, 16, 16, [1, 20, 20], [1, 3, 3])
                .stride([1, 2, 2])
                .dilation([1, 2, 1]),
        );
        assert_eq!(applicable_split(&s), KernelSplitMode::None);
    }

    #[test]
    fn test_split_hw_subproblem_extents() {
        let s = spec(ConvBuilder::backprop_input(1, 256, 256, [1, 34, 34], [1, 3, 3]).stride([1, 2, 2]));
        let p = split_problem(&s, KernelSplitMode::SplitHw).unwrap();
        assert_eq!(p.kernel, Dims3::new(1, 2, 2));
        assert_eq!(p.input, Dims3::new(1, 16, 16));
        assert_eq!(p.output, Dims3::new(1, 17, 17));
        assert_eq!(p.stride, Dims3::ONES);
        assert_eq!(p.phases, 4);
        // The phase problem is itself a consistent convolution.
        for axis in 1..3 {
            let (a, b) = p.pads.axis(axis);
            let input = p.input.to_array()[axis];
            let k = p.kernel.to_array()[axis];
            assert_eq!(input + a + b - (k - 1), p.output.to_array()[axis]);
        }
    }

    #[test]
    fn test_split_h_keeps_width() {
        let s = spec(ConvBuilder::backprop_input(1, 16, 16, [1, 20, 20], [1, 5, 3]).stride([1, 2, 1]));
        let unsplit = s.problem();
        let p = split_problem(&s, KernelSplitMode::SplitH).unwrap();
        assert_eq!(p.kernel.w, 3);
        assert_eq!(p.kernel.h, 3);
        assert_eq!(p.output.w, unsplit.output.w);
        assert_eq!(p.input.w, unsplit.input.w);
        assert_eq!(p.output.h, 10);
        assert_eq!(p.phases, 2);
    }
}
