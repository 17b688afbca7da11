use candle_core::{DType, Result, Tensor};

/// `numel % group_size == 0`.
pub fn is_divisible(numel: usize, group_size: usize) -> bool {
    group_size != 0 && numel % group_size == 0
}

/// Bit-shift helpers used by the byte-width stripe packers/unpackers in
/// [`crate::bitpack`] (the 1/2/4/8-bit codecs, whose containers and shift
/// amounts never exceed 8 bits).
///
/// candle does not expose integer bitwise ops on every backend, so these are
/// implemented over the float32 view of the tensor. That is only exact while
/// every intermediate value stays inside f32's 24-bit mantissa — true for
/// byte-wide containers, but NOT for the 3-bit/32-bit packing (which needs
/// up to 30 significant bits), so that codec does its own exact `i32`
/// arithmetic instead of using these traits.
pub trait LeftshiftOp {
    fn leftshift(&self, shift: u32) -> Result<Tensor>;
}

impl LeftshiftOp for Tensor {
    fn leftshift(&self, shift: u32) -> Result<Tensor> {
        let dtype = self.dtype();
        let factor = (1u64 << shift) as f64;
        self.to_dtype(DType::F32)?
            .affine(factor, 0.)?
            .to_dtype(dtype)
    }
}

/// Combines disjoint bit-field stripes. Every call site in this crate packs
/// stripes into non-overlapping bit ranges by construction, so OR degenerates
/// to addition.
pub trait BitwiseOrOp {
    fn bitwise_or(&self, rhs: &Tensor) -> Result<Tensor>;
}

impl BitwiseOrOp for Tensor {
    fn bitwise_or(&self, rhs: &Tensor) -> Result<Tensor> {
        let dtype = self.dtype();
        let lhs = self.to_dtype(DType::F32)?;
        let rhs = rhs.to_dtype(DType::F32)?;
        (lhs + rhs)?.to_dtype(dtype)
    }
}

/// Extracts one `bits`-wide stripe from a container tensor: shift right by
/// `shift` bits, then mask to the low `bits` bits.
pub trait RightshiftMaskOp {
    fn rightshift_mask(&self, shift: u32, bits: u32) -> Result<Tensor>;
}

impl RightshiftMaskOp for Tensor {
    fn rightshift_mask(&self, shift: u32, bits: u32) -> Result<Tensor> {
        let dtype = self.dtype();
        let div = (1u64 << shift) as f64;
        let modulus = (1u64 << bits) as f64;

        let shifted = self.to_dtype(DType::F32)?.affine(1.0 / div, 0.)?.floor()?;
        // shifted mod modulus = shifted - floor(shifted / modulus) * modulus
        let quotient = shifted.affine(1.0 / modulus, 0.)?.floor()?;
        let quotient = quotient.affine(modulus, 0.)?;
        (shifted - quotient)?.to_dtype(dtype)
    }
}
