//! Checks a host-supplied [ConvRequest] and normalizes it into a [ConvShapeSpec].

use crate::common::{ConvOp, DimSize, Dims3, Dtype, Format};
use crate::shape::{output_extent, resolve_pads, ConvRequest, ConvShapeSpec, Pads};
use crate::target::InstrLimits;

const AXES: [&str; 3] = ["d", "h", "w"];
const TENSOR_AXES: [&str; 5] = ["n", "c", "d", "h", "w"];
const WEIGHT_AXES: [&str; 5] = ["co", "ci_per_group", "kd", "kh", "kw"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must be positive, got {value}")]
    NonPositive { field: String, value: i64 },
    #[error("{field} must not be negative, got {value}")]
    Negative { field: String, value: i64 },
    #[error("{field} = {value} exceeds limit {limit}")]
    OutOfRange {
        field: String,
        value: i64,
        limit: DimSize,
    },
    #[error("{field} = {value} is not divisible by groups = {groups}")]
    GroupMismatch {
        field: String,
        value: i64,
        groups: i64,
    },
    #[error("{field}: expected {expected}, got {actual}")]
    ShapeMismatch {
        field: String,
        expected: i64,
        actual: i64,
    },
    #[error("unsupported {what}: {detail}")]
    Unsupported { what: String, detail: String },
}

impl ValidationError {
    /// Stable numeric code of the failure class.
    pub fn code(&self) -> u32 {
        match self {
            ValidationError::NonPositive { .. } => 1,
            ValidationError::Negative { .. } => 2,
            ValidationError::OutOfRange { .. } => 3,
            ValidationError::GroupMismatch { .. } => 4,
            ValidationError::ShapeMismatch { .. } => 5,
            ValidationError::Unsupported { .. } => 6,
        }
    }

    fn unsupported(what: &str, detail: impl Into<String>) -> Self {
        ValidationError::Unsupported {
            what: what.to_string(),
            detail: detail.into(),
        }
    }
}

fn positive(field: &str, value: i64, limit: DimSize) -> Result<DimSize, ValidationError> {
    if value <= 0 {
        return Err(ValidationError::NonPositive {
            field: field.to_string(),
            value,
        });
    }
    let unsigned = value as DimSize;
    if unsigned > limit {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            value,
            limit,
        });
    }
    Ok(unsigned)
}

fn non_negative(field: &str, value: i64, limit: DimSize) -> Result<DimSize, ValidationError> {
    if value < 0 {
        return Err(ValidationError::Negative {
            field: field.to_string(),
            value,
        });
    }
    let unsigned = value as DimSize;
    if unsigned > limit {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            value,
            limit,
        });
    }
    Ok(unsigned)
}

fn mismatch(field: impl Into<String>, expected: i64, actual: i64) -> ValidationError {
    ValidationError::ShapeMismatch {
        field: field.into(),
        expected,
        actual,
    }
}

fn shape5(
    tensor: &str,
    names: &[&str; 5],
    shape: [i64; 5],
    limit: DimSize,
) -> Result<[DimSize; 5], ValidationError> {
    let mut result = [0; 5];
    for (i, (&dim, name)) in shape.iter().zip(names).enumerate() {
        let field = if tensor.is_empty() {
            name.to_string()
        } else {
            format!("{tensor}.{name}")
        };
        result[i] = positive(&field, dim, limit)?;
    }
    Ok(result)
}

fn triple(
    attr: &str,
    values: [i64; 3],
    limit: DimSize,
) -> Result<Dims3, ValidationError> {
    let mut result = [0; 3];
    for axis in 0..3 {
        result[axis] = positive(&format!("{attr}.{}", AXES[axis]), values[axis], limit)?;
    }
    Ok(Dims3::from(result))
}

fn check_dtypes(request: &ConvRequest) -> Result<(), ValidationError> {
    let fmap = request.input.dtype;
    let weight = request.weight.dtype;
    let out = request.output.dtype;
    if fmap != weight {
        return Err(ValidationError::unsupported(
            "dtype combination",
            format!("activation {fmap} with weight {weight}"),
        ));
    }
    let out_ok = match fmap {
        Dtype::Float16 => matches!(out, Dtype::Float16 | Dtype::Float32),
        Dtype::Bfloat16 => matches!(out, Dtype::Bfloat16 | Dtype::Float32),
        Dtype::Float32 => out == Dtype::Float32,
        Dtype::Int8 => matches!(out, Dtype::Int32 | Dtype::Float16),
        Dtype::Int32 => false,
    };
    if !out_ok {
        return Err(ValidationError::unsupported(
            "dtype combination",
            format!("activation {fmap} with output {out}"),
        ));
    }
    if request.op == ConvOp::BackpropInput && !fmap.is_float() {
        return Err(ValidationError::unsupported(
            "dtype",
            format!("{} requires a float dtype, got {fmap}", request.op),
        ));
    }
    if request.attrs.hf32 && fmap != Dtype::Float32 {
        return Err(ValidationError::unsupported(
            "hf32",
            format!("only valid with {}, got {fmap}", Dtype::Float32),
        ));
    }
    if let Some(bias) = &request.bias {
        if bias.dtype != fmap.accumulator() {
            return Err(ValidationError::unsupported(
                "bias dtype",
                format!("expected {}, got {}", fmap.accumulator(), bias.dtype),
            ));
        }
        if bias.format != Format::Nd {
            return Err(ValidationError::unsupported(
                "bias format",
                bias.format.to_string(),
            ));
        }
    }
    Ok(())
}

fn check_formats(request: &ConvRequest) -> Result<(), ValidationError> {
    for (role, format) in [
        ("input", request.input.format),
        ("output", request.output.format),
    ] {
        if !format.is_activation() {
            return Err(ValidationError::unsupported(
                "format",
                format!("{role} cannot be {format}"),
            ));
        }
    }
    if !request.weight.format.is_weight() {
        return Err(ValidationError::unsupported(
            "format",
            format!("weight cannot be {}", request.weight.format),
        ));
    }
    // 2D layouts carry no depth axis.
    for (role, format, depth) in [
        ("input", request.input.format, request.input.shape[2]),
        ("weight", request.weight.format, request.weight.shape[2]),
        ("output", request.output.format, request.output.shape[2]),
    ] {
        if !format.is_3d() && depth != 1 {
            return Err(mismatch(format!("{role}.d"), 1, depth));
        }
    }
    Ok(())
}

fn check_c04(request: &ConvRequest, ci: DimSize, groups: DimSize) -> Result<(), ValidationError> {
    if request.weight.format != Format::FractalZC04 {
        return Ok(());
    }
    let dtype = request.input.dtype;
    let reason = if request.op != ConvOp::Forward {
        Some("only forward convolutions")
    } else if ci > 4 {
        Some("at most 4 input channels")
    } else if groups != 1 {
        Some("ungrouped convolutions only")
    } else if request.weight.shape[2] != 1 {
        Some("unit kernel depth only")
    } else if dtype.size() != 2 {
        Some("16-bit dtypes only")
    } else {
        None
    };
    match reason {
        Some(r) => Err(ValidationError::unsupported(
            "C04 packing",
            r,
        )),
        None => Ok(()),
    }
}

/// Validates `request` against the instruction limits and normalizes it.
///
/// Every failure names the offending field; nothing is clamped.
pub fn validate(request: &ConvRequest, limits: &InstrLimits) -> Result<ConvShapeSpec, ValidationError> {
    if request.offset_w.is_some() {
        return Err(ValidationError::unsupported(
            "offset_w",
            "weight offsets are not supported",
        ));
    }
    let weight = shape5("", &WEIGHT_AXES, request.weight.shape, limits.max_extent)?;
    let input = shape5("input", &TENSOR_AXES, request.input.shape, limits.max_extent)?;
    let output = shape5("output", &TENSOR_AXES, request.output.shape, limits.max_extent)?;

    let attrs = &request.attrs;
    let groups = positive("groups", attrs.groups, limits.max_groups)?;
    let stride = triple("strides", attrs.strides, limits.max_stride)?;
    let dilation = triple("dilations", attrs.dilations, limits.max_dilation)?;
    for axis in 0..3 {
        positive(
            &format!("kernel.{}", AXES[axis]),
            request.weight.shape[2 + axis],
            limits.max_kernel,
        )?;
    }

    check_dtypes(request)?;
    check_formats(request)?;

    // Forward-role tensors: `x` is the activation, `y` the convolution result.
    let (x, y) = match request.op {
        ConvOp::Forward => (input, output),
        ConvOp::BackpropInput => (output, input),
    };
    let (x_name, y_name) = match request.op {
        ConvOp::Forward => ("input", "output"),
        ConvOp::BackpropInput => ("output", "input"),
    };
    if x[0] != y[0] {
        return Err(mismatch(format!("{y_name}.n"), x[0] as i64, y[0] as i64));
    }
    let ci = x[1];
    let co = weight[0];
    if ci % groups != 0 {
        return Err(ValidationError::GroupMismatch {
            field: "ci".to_string(),
            value: ci as i64,
            groups: groups as i64,
        });
    }
    if co % groups != 0 {
        return Err(ValidationError::GroupMismatch {
            field: "co".to_string(),
            value: co as i64,
            groups: groups as i64,
        });
    }
    if weight[1] * groups != ci {
        return Err(mismatch(
            "ci_per_group",
            (ci / groups) as i64,
            weight[1] as i64,
        ));
    }
    if y[1] != co {
        return Err(mismatch(format!("{y_name}.c"), co as i64, y[1] as i64));
    }
    if let Some(bias) = &request.bias {
        let expected = [co as i64, 1, 1, 1, 1];
        if bias.shape != expected {
            return Err(mismatch("bias.n", co as i64, bias.shape[0]));
        }
    }
    check_c04(request, ci, groups)?;

    let kernel = Dims3::new(weight[2], weight[3], weight[4]);
    let x_spatial = [x[2] as i64, x[3] as i64, x[4] as i64];
    let raw_pads = resolve_pads(
        attrs.pad_mode,
        attrs.pads,
        x_spatial,
        kernel.to_array().map(|k| k as i64),
        attrs.strides,
        attrs.dilations,
    );
    const PAD_NAMES: [&str; 6] = ["head", "tail", "top", "bottom", "left", "right"];
    let mut pads = [0; 6];
    for i in 0..6 {
        pads[i] = non_negative(&format!("pads.{}", PAD_NAMES[i]), raw_pads[i], limits.max_pad)?;
    }
    let pads = Pads::from_array(pads);

    for axis in 0..3 {
        let (a, b) = pads.axis(axis);
        let expected = output_extent(
            x_spatial[axis],
            kernel.to_array()[axis] as i64,
            stride.to_array()[axis] as i64,
            dilation.to_array()[axis] as i64,
            a as i64,
            b as i64,
        );
        let actual = y[2 + axis] as i64;
        if expected != actual {
            return Err(mismatch(
                format!("{y_name}.{}", AXES[axis]),
                expected,
                actual,
            ));
        }
    }
    log::trace!("{x_name} and {y_name} extents agree with the attributes");

    let spec = ConvShapeSpec {
        op: request.op,
        batch: x[0],
        ci,
        co,
        input: Dims3::new(x[2], x[3], x[4]),
        output: Dims3::new(y[2], y[3], y[4]),
        kernel,
        stride,
        dilation,
        pads,
        groups,
        fmap_dtype: request.input.dtype,
        weight_dtype: request.weight.dtype,
        out_dtype: request.output.dtype,
        bias_dtype: request.bias.as_ref().map(|b| b.dtype),
        fmap_format: request.input.format,
        weight_format: request.weight.format,
        out_format: request.output.format,
        hf32: attrs.hf32,
    };

    if spec.op == ConvOp::BackpropInput {
        check_backprop_pads(&spec, limits)?;
    }
    Ok(spec)
}

/// The equivalent forward convolution needs non-negative pads, which holds only
/// while no pad exceeds the dilated kernel reach.
fn check_backprop_pads(spec: &ConvShapeSpec, limits: &InstrLimits) -> Result<(), ValidationError> {
    for axis in 0..3 {
        let reach = spec.dilation.to_array()[axis] * (spec.kernel.to_array()[axis] - 1);
        let (head, tail) = spec.pads.axis(axis);
        if head > reach || tail > reach {
            return Err(ValidationError::unsupported(
                "backprop pads",
                format!(
                    "pad on {} exceeds dilated kernel reach {reach}",
                    AXES[axis]
                ),
            ));
        }
    }
    let bp = spec.backprop_pads().to_array();
    for (i, &p) in bp.iter().enumerate() {
        if p > limits.max_pad {
            return Err(ValidationError::OutOfRange {
                field: format!("backprop_pads[{i}]"),
                value: p as i64,
                limit: limits.max_pad,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::{ConvBuilder, PadMode, TensorDesc};
    use proptest::prelude::*;

    fn limits() -> InstrLimits {
        InstrLimits::default()
    }

    #[test]
    fn test_zero_output_channels_is_rejected() {
        let request = ConvBuilder::forward(1, 16, 0, [1, 8, 8], [1, 3, 3]).build();
        let err = validate(&request, &limits()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::NonPositive {
                field: "co".to_string(),
                value: 0
            }
        );
        assert_eq!(err.code(), 1);
    }

    #[test]
    fn test_stride_over_limit_is_rejected() {
        let request = ConvBuilder::forward(1, 16, 16, [1, 200, 200], [1, 1, 1])
            .stride([1, 64, 1])
            .build();
        assert!(matches!(
            validate(&request, &limits()),
            Err(ValidationError::OutOfRange { ref field, value: 64, limit: 63 }) if field == "strides.h"
        ));
    }

    #[test]
    fn test_group_mismatch_is_rejected() {
        let mut request = ConvBuilder::forward(1, 16, 16, [1, 8, 8], [1, 3, 3]).build();
        request.attrs.groups = 3;
        assert!(matches!(
            validate(&request, &limits()),
            Err(ValidationError::GroupMismatch { .. })
        ));
    }

    #[test]
    fn test_wrong_output_extent_is_rejected() {
        let mut request = ConvBuilder::forward(1, 16, 16, [1, 8, 8], [1, 3, 3]).build();
        request.output.shape[3] = 7;
        assert_eq!(
            validate(&request, &limits()),
            Err(ValidationError::ShapeMismatch {
                field: "output.h".to_string(),
                expected: 6,
                actual: 7
            })
        );
    }

    #[test]
    fn test_offset_w_is_unsupported() {
        let mut request = ConvBuilder::forward(1, 16, 16, [1, 8, 8], [1, 3, 3]).build();
        request.offset_w = Some(TensorDesc::new(Dtype::Int8, Format::Nd, [16, 1, 1, 1, 1]));
        assert!(matches!(
            validate(&request, &limits()),
            Err(ValidationError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_int8_backprop_is_unsupported() {
        let request = ConvBuilder::backprop_input(1, 16, 16, [1, 8, 8], [1, 3, 3])
            .dtype(Dtype::Int8)
            .build();
        assert!(matches!(
            validate(&request, &limits()),
            Err(ValidationError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_c04_needs_few_channels() {
        let request = ConvBuilder::forward(1, 8, 16, [1, 8, 8], [1, 3, 3])
            .formats(Format::Nc1hwc0, Format::FractalZC04, Format::Nc1hwc0)
            .build();
        assert!(matches!(
            validate(&request, &limits()),
            Err(ValidationError::Unsupported { ref what, .. }) if what == "C04 packing"
        ));
        let ok = ConvBuilder::forward(1, 3, 16, [1, 8, 8], [1, 3, 3])
            .formats(Format::Nc1hwc0, Format::FractalZC04, Format::Nc1hwc0)
            .build();
        assert!(validate(&ok, &limits()).unwrap().c04());
    }

    #[test]
    fn test_2d_format_rejects_depth() {
        let request = ConvBuilder::forward(1, 16, 16, [2, 8, 8], [1, 3, 3])
            .formats(Format::Nchw, Format::FractalZ, Format::Nchw)
            .build();
        assert!(matches!(
            validate(&request, &limits()),
            Err(ValidationError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_backprop_pad_beyond_kernel_reach_is_rejected() {
        let request = ConvBuilder::backprop_input(1, 16, 16, [1, 8, 8], [1, 3, 3])
            .pads([0, 0, 3, 3, 0, 0])
            .build();
        assert!(matches!(
            validate(&request, &limits()),
            Err(ValidationError::Unsupported { ref what, .. }) if what == "backprop pads"
        ));
    }

    #[test]
    fn test_backprop_spec_uses_forward_roles() {
        let request = ConvBuilder::backprop_input(2, 8, 32, [1, 34, 34], [1, 3, 3])
            .stride([1, 2, 2])
            .build();
        let spec = validate(&request, &limits()).unwrap();
        assert_eq!(spec.ci, 8);
        assert_eq!(spec.co, 32);
        assert_eq!(spec.input, Dims3::new(1, 34, 34));
        assert_eq!(spec.output, Dims3::new(1, 16, 16));
        assert_eq!(spec.fmap_extents(), spec.output);
    }

    proptest! {
        #[test]
        fn test_builder_requests_validate(
            batch in 1i64..4, ci in 1i64..64, co in 1i64..64,
            h in 4i64..40, w in 4i64..40, kh in 1i64..4, kw in 1i64..4,
            sh in 1i64..3, sw in 1i64..3,
            mode in prop_oneof![Just(PadMode::Valid), Just(PadMode::SameUpper), Just(PadMode::SameLower)],
            bias in any::<bool>(),
        ) {
            let request = ConvBuilder::forward(batch, ci, co, [1, h, w], [1, kh, kw])
                .stride([1, sh, sw])
                .pad_mode(mode)
                .bias(bias)
                .build();
            let spec = validate(&request, &limits()).unwrap();
            prop_assert_eq!(spec.has_bias(), bias);
            prop_assert!(spec.output.h >= 1);
        }

        #[test]
        fn test_nonpositive_extent_never_validates(
            axis in 0usize..5, value in -3i64..=0,
        ) {
            let mut request = ConvBuilder::forward(1, 16, 16, [1, 8, 8], [1, 3, 3]).build();
            request.input.shape[axis] = value;
            let rejected = matches!(
                validate(&request, &limits()),
                Err(ValidationError::NonPositive { .. })
            );
            prop_assert!(rejected);
        }
    }
}
