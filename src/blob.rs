//! The fixed-layout parameter blob handed to the kernel.
//!
//! Fields are little-endian fixed-width integers in declaration order, followed by
//! zero padding up to a multiple of 8 bytes.

use serde::{Deserialize, Serialize};

use crate::blockdim::{AxisSplit, BlockDimResult};
use crate::common::{ConvOp, DimSize};
use crate::shape::{ConvProblem, ConvShapeSpec};
use crate::template::Template;
use crate::tiling::TileShape;

pub const BLOB_ALIGN: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("{field} = {value} does not fit its blob field")]
    Overflow { field: &'static str, value: u64 },
    #[error("blob length {0} is not a multiple of {BLOB_ALIGN}")]
    Misaligned(usize),
    #[error("blob encoding failed: {0}")]
    Encoding(#[from] bincode::Error),
}

fn narrow(field: &'static str, value: DimSize) -> Result<u32, BlobError> {
    u32::try_from(value).map_err(|_| BlobError::Overflow { field, value })
}

/// Per-axis core count, single-core extent and last-core extent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisParams {
    pub dim: u32,
    pub single: u32,
    pub tail: u32,
}

impl AxisParams {
    fn new(field: &'static str, axis: &AxisSplit) -> Result<Self, BlobError> {
        Ok(AxisParams {
            dim: narrow(field, axis.dim)?,
            single: narrow(field, axis.single)?,
            tail: narrow(field, axis.tail)?,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilingData {
    pub batch: u32,
    pub cin: u32,
    pub cout: u32,
    /// Input extents, D, H, W.
    pub input: [u32; 3],
    pub output: [u32; 3],
    pub kernel: [u32; 3],
    pub stride: [u32; 3],
    pub dilation: [u32; 3],
    /// Head, tail, top, bottom, left, right.
    pub pads: [u32; 6],
    pub backprop_pads: [u32; 6],
    pub groups: u32,
    pub groups_opt: u32,
    pub enlarge: u32,
    pub cin_opt: u32,
    pub cout_opt: u32,
    pub cin1_opt: u32,
    pub cout1_opt: u32,
    /// Extents of the problem actually tiled (the sub-problem under a kernel split).
    pub tiled_input: [u32; 3],
    pub tiled_output: [u32; 3],
    pub tiled_kernel: [u32; 3],
    pub k_total: u32,

    pub batch_dim: AxisParams,
    pub depth_dim: AxisParams,
    pub spatial_dim: AxisParams,
    pub n_dim: AxisParams,
    pub group_dim: AxisParams,

    pub ho_l0: u32,
    pub wo_l0: u32,
    pub k_l0: u32,
    pub n_l0: u32,
    pub ho_al1: u32,
    pub wo_al1: u32,
    pub k_al1: u32,
    pub k_bl1: u32,
    pub n_bl1: u32,
    pub ho_tail: u32,
    pub wo_tail: u32,
    pub n_tail: u32,
    pub k_al1_tail: u32,
    pub k_bl1_tail: u32,
    pub phases: u32,

    /// Double buffering, UB BL1 AL1 CL0 BL0 AL0 from bit 5 down to bit 0.
    pub pbuffer_flag: u8,
    pub split_mode: u8,
    pub iter_order: u8,
    pub al1_full_load: u8,
    pub bl1_full_load: u8,
    pub bias_full_load: u8,
    pub load_b1: u8,
    pub load_b2: u8,
    pub group_mode: u8,
    pub kernel_split: u8,
    pub basic_block: u8,
    pub has_bias: u8,
    pub hf32: u8,
    pub dispatch_key: u64,

    /// Element strides of the N, C, D, H, W axes of each tensor.
    pub fmap_strides: [u64; 5],
    pub weight_strides: [u64; 5],
    pub out_strides: [u64; 5],
}

impl TilingData {
    pub fn new(
        spec: &ConvShapeSpec,
        problem: &ConvProblem,
        block: &BlockDimResult,
        tile: &TileShape,
        template: &Template,
    ) -> Result<Self, BlobError> {
        let dims3 = |field, d: crate::common::Dims3| -> Result<[u32; 3], BlobError> {
            Ok([narrow(field, d.d)?, narrow(field, d.h)?, narrow(field, d.w)?])
        };
        let pads6 = |field, p: [DimSize; 6]| -> Result<[u32; 6], BlobError> {
            let mut out = [0; 6];
            for (o, v) in out.iter_mut().zip(p) {
                *o = narrow(field, v)?;
            }
            Ok(out)
        };
        let group = spec.group_info();
        let cube = spec.cube();
        let flags = template.flags();
        let d = &block.dims;

        let x_shape = [spec.batch, spec.ci, spec.input.d, spec.input.h, spec.input.w];
        let y_shape = [spec.batch, spec.co, spec.output.d, spec.output.h, spec.output.w];
        // Backprop input streams dy and writes dx.
        let (fmap_shape, out_shape) = match spec.op {
            ConvOp::Forward => (x_shape, y_shape),
            ConvOp::BackpropInput => (y_shape, x_shape),
        };
        let weight_shape = [
            spec.co,
            spec.ci / spec.groups,
            spec.kernel.d,
            spec.kernel.h,
            spec.kernel.w,
        ];

        Ok(TilingData {
            batch: narrow("batch", spec.batch)?,
            cin: narrow("cin", spec.ci)?,
            cout: narrow("cout", spec.co)?,
            input: dims3("input", spec.input)?,
            output: dims3("output", spec.output)?,
            kernel: dims3("kernel", spec.kernel)?,
            stride: dims3("stride", spec.stride)?,
            dilation: dims3("dilation", spec.dilation)?,
            pads: pads6("pads", spec.pads.to_array())?,
            backprop_pads: pads6("backprop_pads", problem.pads.to_array())?,
            groups: narrow("groups", group.groups)?,
            groups_opt: narrow("groups_opt", group.groups_opt)?,
            enlarge: narrow("enlarge", group.enlarge)?,
            cin_opt: narrow("cin_opt", problem.cin)?,
            cout_opt: narrow("cout_opt", problem.cout)?,
            cin1_opt: narrow("cin1_opt", problem.cin1())?,
            cout1_opt: narrow("cout1_opt", problem.cout1())?,
            tiled_input: dims3("tiled_input", problem.input)?,
            tiled_output: dims3("tiled_output", problem.output)?,
            tiled_kernel: dims3("tiled_kernel", problem.kernel)?,
            k_total: narrow("k_total", problem.k_total())?,

            batch_dim: AxisParams::new("batch_dim", &d.batch)?,
            depth_dim: AxisParams::new("depth_dim", &d.depth)?,
            spatial_dim: AxisParams::new("spatial_dim", &d.spatial)?,
            n_dim: AxisParams::new("n_dim", &d.n)?,
            group_dim: AxisParams::new("group_dim", &d.group)?,

            ho_l0: narrow("ho_l0", tile.l0.spatial.ho)?,
            wo_l0: narrow("wo_l0", tile.l0.spatial.wo)?,
            k_l0: narrow("k_l0", tile.l0.k)?,
            n_l0: narrow("n_l0", tile.l0.n)?,
            ho_al1: narrow("ho_al1", tile.al1.spatial.ho)?,
            wo_al1: narrow("wo_al1", tile.al1.spatial.wo)?,
            k_al1: narrow("k_al1", tile.al1.k)?,
            k_bl1: narrow("k_bl1", tile.bl1.k)?,
            n_bl1: narrow("n_bl1", tile.bl1.n)?,
            ho_tail: narrow("ho_tail", tile.tails.ho)?,
            wo_tail: narrow("wo_tail", tile.tails.wo)?,
            n_tail: narrow("n_tail", tile.tails.n)?,
            k_al1_tail: narrow("k_al1_tail", tile.tails.k_al1)?,
            k_bl1_tail: narrow("k_bl1_tail", tile.tails.k_bl1)?,
            phases: narrow("phases", problem.phases)?,

            pbuffer_flag: tile.pingpong.flag(),
            split_mode: block.mode.code(),
            iter_order: tile.iter_order.code(),
            al1_full_load: tile.al1_full_load.into(),
            bl1_full_load: tile.bl1_full_load.into(),
            bias_full_load: tile.bias_full_load.into(),
            load_b1: flags.load_b1.code(),
            load_b2: flags.load_b2.code(),
            group_mode: flags.group.code(),
            kernel_split: flags.kernel_split.code(),
            basic_block: flags.basic_block.into(),
            has_bias: spec.has_bias().into(),
            hf32: spec.hf32.into(),
            dispatch_key: template.dispatch_key(),

            fmap_strides: spec.fmap_format.element_strides(fmap_shape, cube.k0, cube.n0),
            weight_strides: spec.weight_format.element_strides(weight_shape, cube.k0, cube.n0),
            out_strides: spec.out_format.element_strides(out_shape, cube.n0, cube.n0),
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, BlobError> {
        let mut bytes = bincode::serialize(self)?;
        let padded = bytes.len().div_ceil(BLOB_ALIGN) * BLOB_ALIGN;
        bytes.resize(padded, 0);
        Ok(bytes)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BlobError> {
        if bytes.len() % BLOB_ALIGN != 0 {
            return Err(BlobError::Misaligned(bytes.len()));
        }
        Ok(bincode::deserialize(bytes)?)
    }
}
