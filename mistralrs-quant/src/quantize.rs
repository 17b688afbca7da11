//! Orchestration: reshape into groups, compute the initial affine codebook,
//! optionally refine it, hand codes to [`crate::bitpack`].

use std::sync::Once;

use candle_core::{DType, Tensor};

use crate::bitpack::BitPack;
use crate::error::{QuantError, Result};
use crate::meta::{Meta, WeightQuantParams};
use crate::optimize::{optimize_weights_proximal, OptParams};
use crate::utils::is_divisible;

/// One-time, process-lifetime warnings for the deprecated host fields.
/// Each field gets its own [`Once`] so three distinct deprecated inputs
/// each warn exactly once, independent of how many `quantize` calls
/// observe them.
struct DeprecationGuards {
    scale_quant_params: Once,
    zero_quant_params: Once,
    offload_meta: Once,
}

static DEPRECATION_GUARDS: DeprecationGuards = DeprecationGuards {
    scale_quant_params: Once::new(),
    zero_quant_params: Once::new(),
    offload_meta: Once::new(),
};

fn warn_if_deprecated(params: &WeightQuantParams) {
    if params.deprecated.scale_quant_params.is_some() {
        DEPRECATION_GUARDS.scale_quant_params.call_once(|| {
            tracing::warn!(
                "`scale_quant_params` is deprecated and ignored; scale is never quantized by this crate"
            );
        });
    }
    if params.deprecated.zero_quant_params.is_some() {
        DEPRECATION_GUARDS.zero_quant_params.call_once(|| {
            tracing::warn!(
                "`zero_quant_params` is deprecated and ignored; zero is never quantized by this crate"
            );
        });
    }
    if params.deprecated.offload_meta.is_some() {
        DEPRECATION_GUARDS.offload_meta.call_once(|| {
            tracing::warn!("`offload_meta` is deprecated and ignored");
        });
    }
}

/// `quantize(W, cfg) -> (packed_W_q, meta)`.
pub fn quantize(tensor: &Tensor, params: &WeightQuantParams) -> Result<(Tensor, Meta)> {
    warn_if_deprecated(params);

    if let Some(group_size) = params.group_size {
        if !is_divisible(tensor.elem_count(), group_size) {
            return Err(QuantError::UnsupportedConfiguration(format!(
                "group_size={group_size} does not divide numel={}",
                tensor.elem_count()
            )));
        }
    }

    let shape: Vec<usize> = tensor.dims().to_vec();
    let w = tensor.to_dtype(DType::F32)?;

    let grouped = match (params.group_size, params.channel_wise) {
        (Some(group_size), true) => {
            if params.axis.as_usize() == 1 {
                w.reshape(((), group_size))?
            } else {
                w.reshape((group_size, ()))?
            }
        }
        _ => w.clone(),
    };

    let max_v = params.nbits.max_v();
    let min_v: i64 = 0;

    let (mut scale, mut zero) = if !params.channel_wise {
        let min = grouped.flatten_all()?.min(0)?;
        let max = grouped.flatten_all()?.max(0)?;
        initial_codebook(&min, &max, max_v)?
    } else {
        let min = grouped.min_keepdim(params.axis.as_usize())?;
        let max = grouped.max_keepdim(params.axis.as_usize())?;
        initial_codebook(&min, &max, max_v)?
    };

    if params.round_zero {
        zero = zero.round()?;
    }

    let w_q = if params.optimize && params.channel_wise {
        let refined = optimize_weights_proximal(
            &grouped,
            &scale,
            &zero,
            min_v,
            max_v,
            params.axis,
            OptParams::default(),
        )?;
        scale = refined.scale;
        zero = refined.zero;
        refined.w_q
    } else {
        grouped
            .broadcast_mul(&scale)?
            .broadcast_add(&zero)?
            .round()?
            .clamp(min_v as f64, max_v as f64)?
    };

    // Invert the scale for storage: callers dequantize via
    // `(W_q - zero) * scale` rather than `(W_q - zero) / scale`.
    scale = scale.recip()?;

    let compute_dtype = params.compute_dtype.unwrap_or(DType::F16);

    let (packed, packing, unpack_view_dtype) = if params.bitpack {
        let packing = params.nbits.packing();
        let mut packed = BitPack::pack(packing, &w_q)?;
        if params.view_as_float {
            packed = view_as_float_dtype(&packed, compute_dtype)?;
        }
        (packed, Some(packing), packing.container_dtype())
    } else {
        (w_q.to_dtype(tensor.dtype())?, None, tensor.dtype())
    };

    let meta = Meta {
        nbits: params.nbits,
        group_size: params.group_size,
        shape,
        scale,
        zero,
        axis: params.axis,
        packing,
        unpack_view_dtype,
        view_as_float: params.view_as_float,
        compute_dtype,
    };

    Ok((packed, meta))
}

/// `dequantize(packed_W_q, meta) -> W`.
pub fn dequantize(packed: &Tensor, meta: &Meta) -> Result<Tensor> {
    let w_q = match meta.packing {
        Some(packing) => {
            let container = if meta.view_as_float {
                view_as_float_dtype(packed, meta.unpack_view_dtype)?
            } else {
                packed.clone()
            };
            let trimmed = BitPack::unpack(packing, &container, meta.compute_dtype)?;

            // 3-bit padding rule, matching the upstream reference's
            // dequantize, which trims via `W_r[:meta["group_size"]]` — a
            // no-op slice when group_size is None, so ungrouped 3-bit
            // tensors are left untrimmed here too.
            if matches!(meta.nbits, crate::meta::NBits::Three) {
                let true_len = match meta.axis {
                    crate::meta::Axis::Zero => meta.group_size,
                    crate::meta::Axis::One => meta.group_size.map(|gs| {
                        let numel: usize = meta.shape.iter().product();
                        numel / gs
                    }),
                };
                match true_len {
                    Some(len) => trimmed.narrow(0, 0, len)?,
                    None => trimmed,
                }
            } else {
                trimmed
            }
        }
        None => packed.to_dtype(meta.compute_dtype)?,
    };

    let expected = meta.shape.iter().product::<usize>();
    let w_rec = w_q
        .broadcast_sub(&meta.zero.to_dtype(meta.compute_dtype)?)?
        .broadcast_mul(&meta.scale.to_dtype(meta.compute_dtype)?)?;

    if w_rec.elem_count() != expected {
        return Err(QuantError::ShapeMismatch {
            expected,
            actual: w_rec.elem_count(),
        });
    }

    Ok(w_rec.reshape(meta.shape.clone())?)
}

/// `s = max_v / (max - min)`, falling back to `1.0` on a collapsed group
/// range and clamping to `2e4` to preserve headroom in half precision.
fn initial_codebook(min: &Tensor, max: &Tensor, max_v: i64) -> Result<(Tensor, Tensor)> {
    let denom = (max - min)?;
    let denom_abs = denom.abs()?;
    let small = denom_abs.le(1e-4)?;

    let raw_scale = (Tensor::full(max_v as f32, denom.shape().clone(), denom.device())? / &denom)?;
    let ones = Tensor::ones_like(&raw_scale)?;
    let mut scale = small.where_cond(&ones, &raw_scale)?;
    scale = scale.minimum(&Tensor::full(2e4f32, scale.shape().clone(), scale.device())?)?;

    let zero = min.neg()?.broadcast_mul(&scale)?;
    Ok((scale, zero))
}

/// Bit-reinterprets the packed container as `target` without changing shape
/// or element count. Exact and shape-preserving only when both dtypes are
/// 4 bytes wide (`I32`/`F32` — the 3-bit packing's container). Byte-wide
/// containers (every other supported packing) would need a matching 1-byte
/// float dtype, which this crate's bound tensor backend does not provide —
/// `view_as_float` is therefore only supported for `nbits = 3`.
fn view_as_float_dtype(t: &Tensor, target: DType) -> Result<Tensor> {
    match (t.dtype(), target) {
        (DType::I32, DType::F32) => {
            let bytes: Vec<u8> = t
                .flatten_all()?
                .to_vec1::<i32>()?
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect();
            let floats: Vec<f32> = bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Ok(Tensor::from_vec(floats, t.shape().clone(), t.device())?)
        }
        (DType::F32, DType::I32) => {
            let bytes: Vec<u8> = t
                .flatten_all()?
                .to_vec1::<f32>()?
                .iter()
                .flat_map(|v| v.to_le_bytes())
                .collect();
            let ints: Vec<i32> = bytes
                .chunks_exact(4)
                .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            Ok(Tensor::from_vec(ints, t.shape().clone(), t.device())?)
        }
        (a, b) if a == b => Ok(t.clone()),
        (a, b) => Err(QuantError::UnsupportedConfiguration(format!(
            "view_as_float is only supported between 4-byte containers (I32/F32), got {a:?} -> {b:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Axis, NBits};
    use candle_core::Device;

    fn params(
        nbits: NBits,
        group_size: Option<usize>,
        axis: Axis,
        optimize: bool,
        round_zero: bool,
    ) -> WeightQuantParams {
        let mut builder = WeightQuantParams::builder(nbits, axis)
            .optimize(optimize)
            .round_zero(round_zero);
        if let Some(gs) = group_size {
            builder = builder.group_size(gs);
        }
        builder.build()
    }

    #[test]
    fn arithmetic_sequence_round_trip() {
        let device = Device::Cpu;
        let w: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let w = Tensor::from_vec(w, (64,), &device).unwrap();

        let cfg = params(NBits::Four, Some(64), Axis::Zero, false, true);
        let (packed, meta) = quantize(&w, &cfg).unwrap();
        assert_eq!(packed.elem_count(), 32);

        let rec = dequantize(&packed, &meta).unwrap();
        let rec: Vec<f32> = rec.flatten_all().unwrap().to_dtype(DType::F32).unwrap().to_vec1().unwrap();
        for (orig, got) in w
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap()
            .iter()
            .zip(rec.iter())
        {
            assert!((orig - got).abs() <= 2.2, "orig={orig} got={got}");
        }
    }

    #[test]
    fn all_ones_group_collapses_scale_to_one() {
        let device = Device::Cpu;
        let w = Tensor::ones((4, 8), DType::F32, &device).unwrap();

        let cfg = params(NBits::Four, Some(8), Axis::One, false, false);
        let (packed, meta) = quantize(&w, &cfg).unwrap();
        let rec = dequantize(&packed, &meta).unwrap();
        let rec: Vec<f32> = rec.flatten_all().unwrap().to_dtype(DType::F32).unwrap().to_vec1().unwrap();
        assert!(rec.iter().all(|&v| (v - 1.0).abs() < 1e-4));
    }

    #[test]
    fn channel_wise_false_forces_optimize_false() {
        let cfg = WeightQuantParams::builder(NBits::Four, Axis::Zero)
            .channel_wise(false)
            .optimize(true)
            .build();
        assert!(!cfg.optimize);
    }

    #[test]
    fn three_bit_round_trip_trims_padding() {
        let device = Device::Cpu;
        let w: Vec<f32> = (0..32).map(|i| i as f32).collect();
        let w = Tensor::from_vec(w, (8, 4), &device).unwrap();

        let cfg = params(NBits::Three, Some(8), Axis::Zero, false, false);
        let (packed, meta) = quantize(&w, &cfg).unwrap();
        // 8 rows pad to 10, stripes of 1 row each.
        assert_eq!(packed.dims(), &[1, 4]);
        assert_eq!(packed.dtype(), DType::I32);

        let rec = dequantize(&packed, &meta).unwrap();
        assert_eq!(rec.dims(), &[8, 4]);
        let rec: Vec<f32> = rec
            .flatten_all()
            .unwrap()
            .to_dtype(DType::F32)
            .unwrap()
            .to_vec1()
            .unwrap();
        let orig: Vec<f32> = w.flatten_all().unwrap().to_vec1().unwrap();
        for (o, r) in orig.iter().zip(rec.iter()) {
            assert!((o - r).abs() <= 3.0, "orig={o} got={r}");
        }
    }

    #[test]
    fn ternary_uses_two_bit_packing_slot() {
        assert_eq!(NBits::OnePointFiveEight.packing().id(), "2bit_u8");
        assert_eq!(NBits::OnePointFiveEight.max_v(), 2);
    }
}
