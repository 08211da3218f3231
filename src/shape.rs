use serde::{Deserialize, Serialize};
use std::fmt;

use crate::common::{ConvOp, CubeUnit, DimSize, Dims3, Dtype, Format};
use crate::kernelsplit::KernelSplitMode;
use crate::utils::{align_up, ceil_div, lcm};

/// A tensor as supplied by the host, with dims in logical N, C, D, H, W order
/// (Co, Ci/groups, Kd, Kh, Kw for weights). Dims are signed so that malformed
/// host input can be reported rather than wrapped.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorDesc {
    pub dtype: Dtype,
    pub format: Format,
    pub shape: [i64; 5],
}

impl TensorDesc {
    pub fn new(dtype: Dtype, format: Format, shape: [i64; 5]) -> Self {
        TensorDesc {
            dtype,
            format,
            shape,
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
    clap::ValueEnum,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum PadMode {
    Explicit,
    Valid,
    SameUpper,
    SameLower,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvAttrs {
    /// D, H, W.
    pub strides: [i64; 3],
    /// Head, tail, top, bottom, left, right.
    pub pads: [i64; 6],
    pub dilations: [i64; 3],
    pub groups: i64,
    pub pad_mode: PadMode,
    pub hf32: bool,
}

/// Everything the host hands over for one convolution.
///
/// For [ConvOp::Forward], `input` is the activation and `output` the result. For
/// [ConvOp::BackpropInput], `input` is the output gradient and `output` is the
/// input gradient being computed.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvRequest {
    pub op: ConvOp,
    pub input: TensorDesc,
    pub weight: TensorDesc,
    pub bias: Option<TensorDesc>,
    pub offset_w: Option<TensorDesc>,
    pub output: TensorDesc,
    pub attrs: ConvAttrs,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pads {
    pub head: DimSize,
    pub tail: DimSize,
    pub top: DimSize,
    pub bottom: DimSize,
    pub left: DimSize,
    pub right: DimSize,
}

impl Pads {
    pub fn from_array(p: [DimSize; 6]) -> Self {
        Pads {
            head: p[0],
            tail: p[1],
            top: p[2],
            bottom: p[3],
            left: p[4],
            right: p[5],
        }
    }

    pub fn to_array(self) -> [DimSize; 6] {
        [
            self.head,
            self.tail,
            self.top,
            self.bottom,
            self.left,
            self.right,
        ]
    }

    /// Leading and trailing pad of the D (0), H (1) or W (2) axis.
    pub fn axis(&self, axis: usize) -> (DimSize, DimSize) {
        let a = self.to_array();
        (a[2 * axis], a[2 * axis + 1])
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
pub enum GroupMode {
    /// `groups == 1`.
    Normal,
    /// Grouped, each group planned on its own.
    Original,
    /// Grouped, several groups packed into one block-diagonal weight.
    Enlarged,
}

impl GroupMode {
    pub fn code(&self) -> u8 {
        match self {
            GroupMode::Normal => 0,
            GroupMode::Original => 1,
            GroupMode::Enlarged => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(GroupMode::Normal),
            1 => Some(GroupMode::Original),
            2 => Some(GroupMode::Enlarged),
            _ => None,
        }
    }
}

impl fmt::Display for GroupMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupMode::Normal => write!(f, "normal"),
            GroupMode::Original => write!(f, "original"),
            GroupMode::Enlarged => write!(f, "enlarged"),
        }
    }
}

/// Group-enlargement factors. `k` is the reduction side and `n` the produced side,
/// so for backprop input `k` counts output channels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupInfo {
    pub groups: DimSize,
    pub enlarge: DimSize,
    pub groups_opt: DimSize,
    pub k_per_group: DimSize,
    pub n_per_group: DimSize,
    pub k_opt: DimSize,
    pub n_opt: DimSize,
    pub mode: GroupMode,
}

impl GroupInfo {
    pub fn new(k_per_group: DimSize, n_per_group: DimSize, groups: DimSize, cube: CubeUnit) -> Self {
        if groups <= 1 {
            return GroupInfo {
                groups: 1,
                enlarge: 1,
                groups_opt: 1,
                k_per_group,
                n_per_group,
                k_opt: k_per_group,
                n_opt: n_per_group,
                mode: GroupMode::Normal,
            };
        }
        let mag_k = lcm(k_per_group, cube.k0) / k_per_group;
        let mag_n = lcm(n_per_group, cube.n0) / n_per_group;
        let enlarge = lcm(mag_k, mag_n).min(groups);
        GroupInfo {
            groups,
            enlarge,
            groups_opt: ceil_div(groups, enlarge),
            k_per_group,
            n_per_group,
            k_opt: k_per_group * enlarge,
            n_opt: n_per_group * enlarge,
            mode: if enlarge == 1 {
                GroupMode::Original
            } else {
                GroupMode::Enlarged
            },
        }
    }
}

/// A validated, normalized convolution. Never mutated after validation.
///
/// Extents are given in forward roles: `input`/`ci` is the activation side and
/// `output`/`co` the result side, also for backprop input (where `input` is the
/// gradient being produced). `fmap_*` describes the tensor the cube streams as
/// its left operand and `out_*` the tensor it writes.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvShapeSpec {
    pub op: ConvOp,
    pub batch: DimSize,
    pub ci: DimSize,
    pub co: DimSize,
    pub input: Dims3,
    pub output: Dims3,
    pub kernel: Dims3,
    pub stride: Dims3,
    pub dilation: Dims3,
    pub pads: Pads,
    pub groups: DimSize,
    pub fmap_dtype: Dtype,
    pub weight_dtype: Dtype,
    pub out_dtype: Dtype,
    pub bias_dtype: Option<Dtype>,
    pub fmap_format: Format,
    pub weight_format: Format,
    pub out_format: Format,
    pub hf32: bool,
}

impl ConvShapeSpec {
    pub fn cube(&self) -> CubeUnit {
        self.fmap_dtype.cube_unit()
    }

    pub fn has_bias(&self) -> bool {
        self.bias_dtype.is_some()
    }

    pub fn is_3d(&self) -> bool {
        self.fmap_format.is_3d()
    }

    pub fn c04(&self) -> bool {
        self.op == ConvOp::Forward && self.weight_format == Format::FractalZC04
    }

    pub fn group_info(&self) -> GroupInfo {
        let (k_side, n_side) = match self.op {
            ConvOp::Forward => (self.ci, self.co),
            ConvOp::BackpropInput => (self.co, self.ci),
        };
        GroupInfo::new(
            k_side / self.groups,
            n_side / self.groups,
            self.groups,
            self.cube(),
        )
    }

    /// Extents of the tensor the cube streams: `input` for forward, the output
    /// gradient (`output`) for backprop input.
    pub fn fmap_extents(&self) -> Dims3 {
        match self.op {
            ConvOp::Forward => self.input,
            ConvOp::BackpropInput => self.output,
        }
    }

    /// Pads of the forward convolution equivalent to backprop input, which slides
    /// the flipped kernel over the stride-dilated output gradient.
    pub fn backprop_pads(&self) -> Pads {
        let mut result = [0; 6];
        for axis in 0..3 {
            let input = self.input.to_array()[axis];
            let output = self.output.to_array()[axis];
            let k = self.kernel.to_array()[axis];
            let s = self.stride.to_array()[axis];
            let dil = self.dilation.to_array()[axis];
            let (head, _) = self.pads.axis(axis);
            let reach = dil * (k - 1);
            let bp_head = reach.saturating_sub(head);
            let bp_tail = (input + reach).saturating_sub((output - 1) * s + 1 + bp_head);
            result[2 * axis] = bp_head;
            result[2 * axis + 1] = bp_tail;
        }
        Pads::from_array(result)
    }

    /// The forward convolution the tiler actually plans, before any kernel split.
    pub fn problem(&self) -> ConvProblem {
        let group = self.group_info();
        let (input, output, stride, pads) = match self.op {
            ConvOp::Forward => (self.input, self.output, self.stride, self.pads),
            ConvOp::BackpropInput => (
                Dims3::new(
                    (self.output.d - 1) * self.stride.d + 1,
                    (self.output.h - 1) * self.stride.h + 1,
                    (self.output.w - 1) * self.stride.w + 1,
                ),
                self.input,
                Dims3::ONES,
                self.backprop_pads(),
            ),
        };
        ConvProblem {
            op: self.op,
            batch: self.batch,
            groups: group.groups_opt,
            cin: group.k_opt,
            cout: group.n_opt,
            input,
            output,
            kernel: self.kernel,
            stride,
            dilation: self.dilation,
            pads,
            fmap_dtype: self.fmap_dtype,
            weight_dtype: self.weight_dtype,
            out_dtype: self.out_dtype,
            bias_dtype: self.bias_dtype,
            fmap_channel_last: self.fmap_format.is_channel_last(),
            out_channel_last: self.out_format.is_channel_last(),
            split_depth: self.is_3d(),
            group_mode: group.mode,
            c04: self.c04(),
            kernel_split: KernelSplitMode::None,
            phases: 1,
        }
    }
}

impl fmt::Display for ConvShapeSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} n={} ci={} co={} in={} out={} k={} s={} dil={} g={} {}",
            self.op,
            self.batch,
            self.ci,
            self.co,
            self.input,
            self.output,
            self.kernel,
            self.stride,
            self.dilation,
            self.groups,
            self.fmap_dtype
        )
    }
}

/// The GEMM-shaped forward convolution handed to block-dim decision and tile search.
///
/// `cin` is the reduction-side channel count per (possibly enlarged) group and
/// `cout` the produced-side one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvProblem {
    pub op: ConvOp,
    pub batch: DimSize,
    pub groups: DimSize,
    pub cin: DimSize,
    pub cout: DimSize,
    pub input: Dims3,
    pub output: Dims3,
    pub kernel: Dims3,
    pub stride: Dims3,
    pub dilation: Dims3,
    pub pads: Pads,
    pub fmap_dtype: Dtype,
    pub weight_dtype: Dtype,
    pub out_dtype: Dtype,
    pub bias_dtype: Option<Dtype>,
    pub fmap_channel_last: bool,
    pub out_channel_last: bool,
    pub split_depth: bool,
    pub group_mode: GroupMode,
    pub c04: bool,
    pub kernel_split: KernelSplitMode,
    /// Sub-kernels executed one after another; 1 without a kernel split.
    pub phases: DimSize,
}

impl ConvProblem {
    pub fn cube(&self) -> CubeUnit {
        self.fmap_dtype.cube_unit()
    }

    pub fn cin1(&self) -> DimSize {
        ceil_div(self.cin, self.cube().k0)
    }

    pub fn cout1(&self) -> DimSize {
        ceil_div(self.cout, self.cube().n0)
    }

    pub fn dilated_kernel(&self) -> Dims3 {
        Dims3::new(
            (self.kernel.d - 1) * self.dilation.d + 1,
            (self.kernel.h - 1) * self.dilation.h + 1,
            (self.kernel.w - 1) * self.dilation.w + 1,
        )
    }

    /// The GEMM reduction extent, in elements.
    pub fn k_total(&self) -> DimSize {
        let k0 = self.cube().k0;
        if self.c04 {
            self.kernel.d * align_up(4 * self.kernel.h * self.kernel.w, k0)
        } else {
            self.kernel.d * self.cin1() * self.kernel.h * self.kernel.w * k0
        }
    }

    /// K elements covered by one activation channel block across the whole kernel window.
    pub fn k_window(&self) -> DimSize {
        if self.c04 {
            self.k_total() / self.kernel.d
        } else {
            self.kernel.h * self.kernel.w * self.cube().k0
        }
    }

    pub fn has_bias(&self) -> bool {
        self.bias_dtype.is_some()
    }
}

/// Resolves the pad list for a pad mode. Inputs are unvalidated.
pub fn resolve_pads(
    pad_mode: PadMode,
    explicit: [i64; 6],
    input: [i64; 3],
    kernel: [i64; 3],
    strides: [i64; 3],
    dilations: [i64; 3],
) -> [i64; 6] {
    match pad_mode {
        PadMode::Explicit => explicit,
        PadMode::Valid => [0; 6],
        PadMode::SameUpper | PadMode::SameLower => {
            let mut pads = [0; 6];
            for axis in 0..3 {
                let s = strides[axis].max(1);
                let out = (input[axis] + s - 1) / s;
                let total =
                    ((out - 1) * s + (kernel[axis] - 1) * dilations[axis] + 1 - input[axis]).max(0);
                let (head, tail) = if pad_mode == PadMode::SameUpper {
                    (total / 2, total - total / 2)
                } else {
                    (total - total / 2, total / 2)
                };
                pads[2 * axis] = head;
                pads[2 * axis + 1] = tail;
            }
            pads
        }
    }
}

/// Standard convolution output extent; 0 when the dilated kernel overruns the padded input.
pub fn output_extent(input: i64, kernel: i64, stride: i64, dilation: i64, pad_a: i64, pad_b: i64) -> i64 {
    let numerator = input + pad_a + pad_b - dilation * (kernel - 1) - 1;
    if numerator < 0 || stride <= 0 {
        return 0;
    }
    numerator / stride + 1
}

/// Convenience constructor of well-formed [ConvRequest]s from forward-role extents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvBuilder {
    op: ConvOp,
    batch: i64,
    ci: i64,
    co: i64,
    input: [i64; 3],
    kernel: [i64; 3],
    stride: [i64; 3],
    dilation: [i64; 3],
    pads: [i64; 6],
    groups: i64,
    pad_mode: PadMode,
    dtype: Dtype,
    out_dtype: Option<Dtype>,
    bias: bool,
    hf32: bool,
    fmap_format: Format,
    weight_format: Format,
    out_format: Format,
}

impl ConvBuilder {
    /// `input` is the activation extent; for backprop input, the gradient being produced.
    pub fn new(op: ConvOp, batch: i64, ci: i64, co: i64, input: [i64; 3], kernel: [i64; 3]) -> Self {
        ConvBuilder {
            op,
            batch,
            ci,
            co,
            input,
            kernel,
            stride: [1; 3],
            dilation: [1; 3],
            pads: [0; 6],
            groups: 1,
            pad_mode: PadMode::Explicit,
            dtype: Dtype::Float16,
            out_dtype: None,
            bias: false,
            hf32: false,
            fmap_format: Format::Ndc1hwc0,
            weight_format: Format::FractalZ3d,
            out_format: Format::Ndc1hwc0,
        }
    }

    pub fn forward(batch: i64, ci: i64, co: i64, input: [i64; 3], kernel: [i64; 3]) -> Self {
        Self::new(ConvOp::Forward, batch, ci, co, input, kernel)
    }

    pub fn backprop_input(batch: i64, ci: i64, co: i64, input: [i64; 3], kernel: [i64; 3]) -> Self {
        Self::new(ConvOp::BackpropInput, batch, ci, co, input, kernel)
    }

    pub fn stride(mut self, stride: [i64; 3]) -> Self {
        self.stride = stride;
        self
    }

    pub fn dilation(mut self, dilation: [i64; 3]) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn pads(mut self, pads: [i64; 6]) -> Self {
        self.pads = pads;
        self
    }

    pub fn pad_mode(mut self, pad_mode: PadMode) -> Self {
        self.pad_mode = pad_mode;
        self
    }

    pub fn groups(mut self, groups: i64) -> Self {
        self.groups = groups;
        self
    }

    pub fn dtype(mut self, dtype: Dtype) -> Self {
        self.dtype = dtype;
        self
    }

    pub fn out_dtype(mut self, dtype: Dtype) -> Self {
        self.out_dtype = Some(dtype);
        self
    }

    pub fn bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    pub fn hf32(mut self, hf32: bool) -> Self {
        self.hf32 = hf32;
        self
    }

    pub fn formats(mut self, fmap: Format, weight: Format, out: Format) -> Self {
        self.fmap_format = fmap;
        self.weight_format = weight;
        self.out_format = out;
        self
    }

    pub fn build(&self) -> ConvRequest {
        let pads = resolve_pads(
            self.pad_mode,
            self.pads,
            self.input,
            self.kernel,
            self.stride,
            self.dilation,
        );
        let mut output = [0; 3];
        for axis in 0..3 {
            output[axis] = output_extent(
                self.input[axis],
                self.kernel[axis],
                self.stride[axis],
                self.dilation[axis],
                pads[2 * axis],
                pads[2 * axis + 1],
            );
        }
        let out_dtype = self.out_dtype.unwrap_or(if self.dtype.is_float() {
            self.dtype
        } else {
            Dtype::Int32
        });
        let [di, hi, wi] = self.input;
        let [d_out, ho, wo] = output;
        let x_shape = [self.batch, self.ci, di, hi, wi];
        let y_shape = [self.batch, self.co, d_out, ho, wo];
        let ci_per_group = if self.groups > 0 {
            self.ci / self.groups
        } else {
            self.ci
        };
        let weight = TensorDesc::new(
            self.dtype,
            self.weight_format,
            [self.co, ci_per_group, self.kernel[0], self.kernel[1], self.kernel[2]],
        );
        let (input, output) = match self.op {
            ConvOp::Forward => (
                TensorDesc::new(self.dtype, self.fmap_format, x_shape),
                TensorDesc::new(out_dtype, self.out_format, y_shape),
            ),
            ConvOp::BackpropInput => (
                TensorDesc::new(self.dtype, self.fmap_format, y_shape),
                TensorDesc::new(out_dtype, self.out_format, x_shape),
            ),
        };
        let bias = self.bias.then(|| {
            TensorDesc::new(
                self.dtype.accumulator(),
                Format::Nd,
                [self.co, 1, 1, 1, 1],
            )
        });
        ConvRequest {
            op: self.op,
            input,
            weight,
            bias,
            offset_w: None,
            output,
            attrs: ConvAttrs {
                strides: self.stride,
                pads: self.pads,
                dilations: self.dilation,
                groups: self.groups,
                pad_mode: self.pad_mode,
                hf32: self.hf32,
            },
        }
    }
}
