use serde::{Deserialize, Serialize};
use std::fmt::Display;

pub type DimSize = u64;

/// Bytes in one C0 block, the minimum addressable unit of every cube-side buffer.
pub const C0_BYTES: u64 = 32;
/// Rows and columns of one cube fractal along M and N.
pub const BLOCK_CUBE: u64 = 16;

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
pub enum Dtype {
    Float16,
    Bfloat16,
    Float32,
    Int8,
    Int32,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u64 {
        match self {
            Dtype::Int8 => 1,
            Dtype::Float16 | Dtype::Bfloat16 => 2,
            Dtype::Float32 | Dtype::Int32 => 4,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, Dtype::Float16 | Dtype::Bfloat16 | Dtype::Float32)
    }

    /// The dtype the cube unit accumulates into when fed with this dtype.
    pub fn accumulator(&self) -> Dtype {
        if self.is_float() {
            Dtype::Float32
        } else {
            Dtype::Int32
        }
    }

    /// Fractal shape of one cube instruction for this input dtype.
    pub fn cube_unit(&self) -> CubeUnit {
        CubeUnit {
            m0: BLOCK_CUBE,
            k0: C0_BYTES / self.size(),
            n0: BLOCK_CUBE,
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Bfloat16 => write!(f, "bf16"),
            Dtype::Float32 => write!(f, "f32"),
            Dtype::Int8 => write!(f, "i8"),
            Dtype::Int32 => write!(f, "i32"),
        }
    }
}

/// Element counts of one cube fractal (M x K times K x N).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct CubeUnit {
    pub m0: DimSize,
    pub k0: DimSize,
    pub n0: DimSize,
}

/// Memory layout tag of a tensor.
///
/// Shapes are always described in logical N, C, D, H, W order (weights as
/// Co, Ci/groups, Kd, Kh, Kw); the format only says how elements are laid out.
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
pub enum Format {
    Ncdhw,
    Ndhwc,
    Nchw,
    Nhwc,
    /// Packed activation: N, D, C1, H, W, C0.
    Ndc1hwc0,
    /// Packed activation: N, C1, H, W, C0.
    Nc1hwc0,
    /// Packed weight: (Kd, C1, Kh, Kw), N1, N0, C0.
    FractalZ3d,
    FractalZ,
    /// Packed weight with four input channels folded into the kernel window.
    FractalZC04,
    /// One-dimensional, used for bias.
    Nd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutClass {
    ChannelFirst,
    ChannelLast,
    Packed,
}

impl Format {
    pub fn class(&self) -> LayoutClass {
        match self {
            Format::Ncdhw | Format::Nchw | Format::Nd => LayoutClass::ChannelFirst,
            Format::Ndhwc | Format::Nhwc => LayoutClass::ChannelLast,
            Format::Ndc1hwc0
            | Format::Nc1hwc0
            | Format::FractalZ3d
            | Format::FractalZ
            | Format::FractalZC04 => LayoutClass::Packed,
        }
    }

    pub fn is_channel_last(&self) -> bool {
        self.class() == LayoutClass::ChannelLast
    }

    /// True for formats that carry a depth axis.
    pub fn is_3d(&self) -> bool {
        matches!(
            self,
            Format::Ncdhw | Format::Ndhwc | Format::Ndc1hwc0 | Format::FractalZ3d
        )
    }

    pub fn is_activation(&self) -> bool {
        matches!(
            self,
            Format::Ncdhw
                | Format::Ndhwc
                | Format::Nchw
                | Format::Nhwc
                | Format::Ndc1hwc0
                | Format::Nc1hwc0
        )
    }

    pub fn is_weight(&self) -> bool {
        matches!(
            self,
            Format::Ncdhw
                | Format::Ndhwc
                | Format::Nchw
                | Format::Nhwc
                | Format::FractalZ3d
                | Format::FractalZ
                | Format::FractalZC04
        )
    }

    /// Element strides of the logical N, C, D, H, W axes.
    ///
    /// For packed formats the C entry is the stride between C0 blocks, and for
    /// fractal weights the N entry (output channels) is the stride within an N0 block.
    pub fn element_strides(&self, shape: [DimSize; 5], c0: DimSize, n0: DimSize) -> [DimSize; 5] {
        let [n, c, d, h, w] = shape;
        match self {
            Format::Ncdhw | Format::Nchw | Format::Nd => {
                [c * d * h * w, d * h * w, h * w, w, 1]
            }
            Format::Ndhwc | Format::Nhwc => [d * h * w * c, 1, h * w * c, w * c, c],
            Format::Ndc1hwc0 | Format::Nc1hwc0 => {
                let c1 = crate::utils::ceil_div(c, c0);
                let plane = h * w * c0;
                [d * c1 * plane, plane, c1 * plane, w * c0, c0]
            }
            Format::FractalZ3d | Format::FractalZ | Format::FractalZC04 => {
                let n1 = crate::utils::ceil_div(n, n0);
                let fractal = n1 * n0 * c0;
                let c1 = crate::utils::ceil_div(c, c0);
                [c0, h * w * fractal, c1 * h * w * fractal, w * fractal, fractal]
            }
        }
    }
}

impl Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Format::Ncdhw => "NCDHW",
            Format::Ndhwc => "NDHWC",
            Format::Nchw => "NCHW",
            Format::Nhwc => "NHWC",
            Format::Ndc1hwc0 => "NDC1HWC0",
            Format::Nc1hwc0 => "NC1HWC0",
            Format::FractalZ3d => "FRACTAL_Z_3D",
            Format::FractalZ => "FRACTAL_Z",
            Format::FractalZC04 => "FRACTAL_Z_C04",
            Format::Nd => "ND",
        };
        write!(f, "{}", s)
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
pub enum ConvOp {
    Forward,
    BackpropInput,
}

impl Display for ConvOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConvOp::Forward => write!(f, "forward"),
            ConvOp::BackpropInput => write!(f, "backprop-input"),
        }
    }
}

/// A depth/height/width triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Dims3 {
    pub d: DimSize,
    pub h: DimSize,
    pub w: DimSize,
}

impl Dims3 {
    pub const ONES: Dims3 = Dims3 { d: 1, h: 1, w: 1 };

    pub const fn new(d: DimSize, h: DimSize, w: DimSize) -> Self {
        Dims3 { d, h, w }
    }

    pub fn volume(&self) -> DimSize {
        self.d * self.h * self.w
    }

    pub fn to_array(self) -> [DimSize; 3] {
        [self.d, self.h, self.w]
    }
}

impl From<[DimSize; 3]> for Dims3 {
    fn from(v: [DimSize; 3]) -> Self {
        Dims3::new(v[0], v[1], v[2])
    }
}

impl Display for Dims3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.d, self.h, self.w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cube_unit_k0_fills_one_c0_block() {
        for dtype in enum_iterator::all::<Dtype>() {
            let unit = dtype.cube_unit();
            assert_eq!(unit.k0 * dtype.size(), C0_BYTES);
            assert_eq!(unit.m0, 16);
            assert_eq!(unit.n0, 16);
        }
    }

    #[test]
    fn test_ncdhw_strides() {
        let strides = Format::Ncdhw.element_strides([2, 3, 4, 5, 6], 16, 16);
        assert_eq!(strides, [360, 120, 30, 6, 1]);
    }

    #[test]
    fn test_ndhwc_strides() {
        let strides = Format::Ndhwc.element_strides([2, 3, 4, 5, 6], 16, 16);
        assert_eq!(strides, [360, 1, 90, 18, 3]);
    }

    proptest! {
        #[test]
        fn test_dense_formats_have_unit_innermost_stride(
            shape in proptest::array::uniform5(1u64..9),
            format in prop_oneof![
                Just(Format::Ncdhw), Just(Format::Ndhwc), Just(Format::Nchw), Just(Format::Nhwc)
            ],
        ) {
            let strides = format.element_strides(shape, 16, 16);
            prop_assert!(strides.contains(&1));
            prop_assert_eq!(strides[0], shape[1..].iter().product::<u64>());
        }
    }
}
