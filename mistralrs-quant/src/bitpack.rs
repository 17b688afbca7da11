//! Stateless codec between a flat array of small non-negative integer codes
//! and a densely packed container tensor.
//!
//! Layout rule for a packing with ratio `r`: split the length-`L` code
//! tensor into `r` equal stripes of length `L/r`. The packed value at
//! position `i` is `sum_k C[k*(L/r) + i] << (bits*(r-1-k))`. Unpacking
//! inverts this per stripe.

use candle_core::{DType, Result, Tensor};

use crate::error::Result as QResult;
use crate::meta::Packing;
use crate::utils::{BitwiseOrOp, LeftshiftOp, RightshiftMaskOp};

/// Pure, stateless pack/unpack codecs, one function per supported width.
pub struct BitPack;

impl BitPack {
    /// Dispatches to the codec registered for `packing`. The only
    /// unsupported-configuration failure mode at this layer: none — every
    /// [`Packing`] variant has a codec, so this is total. Kept as a
    /// `Result` return for symmetry with [`BitPack::unpack`], whose caller
    /// (the `Quantizer`) can fail earlier on an unrecognized `nbits`.
    pub fn pack(packing: Packing, codes: &Tensor) -> QResult<Tensor> {
        let packed = match packing {
            Packing::U8Identity => Self::pack_8bit_u8(codes)?,
            Packing::U8Nibble => Self::pack_4bit_u8(codes)?,
            Packing::U8Quad => Self::pack_2bit_u8(codes)?,
            Packing::U8Oct => Self::pack_1bit_u8(codes)?,
            Packing::I32Deca => Self::pack_3bit_32(codes)?,
        };
        Ok(packed)
    }

    pub fn unpack(packing: Packing, container: &Tensor, dtype: DType) -> QResult<Tensor> {
        let unpacked = match packing {
            Packing::U8Identity => Self::unpack_8bit_u8(container, dtype)?,
            Packing::U8Nibble => Self::unpack_4bit_u8(container, dtype)?,
            Packing::U8Quad => Self::unpack_2bit_u8(container, dtype)?,
            Packing::U8Oct => Self::unpack_1bit_u8(container, dtype)?,
            Packing::I32Deca => Self::unpack_3bit_32(container, dtype)?,
        };
        Ok(unpacked)
    }

    pub fn pack_8bit_u8(wq: &Tensor) -> Result<Tensor> {
        wq.to_dtype(DType::U8)
    }

    pub fn unpack_8bit_u8(container: &Tensor, dtype: DType) -> Result<Tensor> {
        container.to_dtype(dtype)
    }

    /// High nibble = first half of `C`, low nibble = second half.
    pub fn pack_4bit_u8(wq: &Tensor) -> Result<Tensor> {
        let wq = wq.to_dtype(DType::U8)?;
        let step = wq.dims()[0] / 2;
        let a = wq.narrow(0, 0, step)?;
        let b = wq.narrow(0, step, step)?;
        a.leftshift(4)?.bitwise_or(&b)
    }

    pub fn unpack_4bit_u8(container: &Tensor, dtype: DType) -> Result<Tensor> {
        let hi = container.rightshift_mask(4, 4)?;
        let lo = container.rightshift_mask(0, 4)?;
        Tensor::cat(&[&hi, &lo], 0)?.to_dtype(dtype)
    }

    /// 4 codes per byte, MSB-first by quarter position in `C`.
    pub fn pack_2bit_u8(wq: &Tensor) -> Result<Tensor> {
        let wq = wq.to_dtype(DType::U8)?;
        let step = wq.dims()[0] / 4;
        let a = wq.narrow(0, 0, step)?;
        let b = wq.narrow(0, step, step)?;
        let c = wq.narrow(0, step * 2, step)?;
        let d = wq.narrow(0, step * 3, step)?;
        a.leftshift(6)?
            .bitwise_or(&b.leftshift(4)?)?
            .bitwise_or(&c.leftshift(2)?)?
            .bitwise_or(&d)
    }

    pub fn unpack_2bit_u8(container: &Tensor, dtype: DType) -> Result<Tensor> {
        let a = container.rightshift_mask(6, 2)?;
        let b = container.rightshift_mask(4, 2)?;
        let c = container.rightshift_mask(2, 2)?;
        let d = container.rightshift_mask(0, 2)?;
        Tensor::cat(&[&a, &b, &c, &d], 0)?.to_dtype(dtype)
    }

    /// 8 codes per byte, MSB-first by octant in `C`.
    pub fn pack_1bit_u8(wq: &Tensor) -> Result<Tensor> {
        let wq = wq.to_dtype(DType::U8)?;
        let step = wq.dims()[0] / 8;
        let stripes: Vec<Tensor> = (0..8)
            .map(|k| wq.narrow(0, step * k, step))
            .collect::<Result<_>>()?;
        let mut acc = stripes[0].leftshift(7)?;
        for (k, stripe) in stripes.iter().enumerate().skip(1) {
            acc = acc.bitwise_or(&stripe.leftshift(7 - k as u32)?)?;
        }
        Ok(acc)
    }

    pub fn unpack_1bit_u8(container: &Tensor, dtype: DType) -> Result<Tensor> {
        let stripes: Vec<Tensor> = (0..8)
            .map(|k| container.rightshift_mask(7 - k, 1))
            .collect::<Result<_>>()?;
        let refs: Vec<&Tensor> = stripes.iter().collect();
        Tensor::cat(&refs, 0)?.to_dtype(dtype)
    }

    /// 10 codes per 32-bit word, shifted by `3*k`. The caller pads the
    /// code tensor along dim 0 up to a multiple of 10 before packing; this
    /// function does that padding itself so it is total over any length.
    ///
    /// A packed word needs up to 30 significant bits (10 stripes * 3 bits),
    /// which exceeds f32's 24-bit exact-integer mantissa — so unlike the
    /// byte-width packings above, this codec does the shift/OR/mask in
    /// exact `i32` host arithmetic rather than routing through
    /// [`crate::utils`]'s float32 stand-ins.
    pub fn pack_3bit_32(wq: &Tensor) -> Result<Tensor> {
        let device = wq.device();
        let cols = wq.dims()[1];
        let rows = wq.dims()[0];
        let padded_rows = 10 * rows.div_ceil(10);
        let step = padded_rows / 10;

        let mut values = wq.to_dtype(DType::I32)?.flatten_all()?.to_vec1::<i32>()?;
        values.resize(padded_rows * cols, 0);

        let mut packed = vec![0i32; step * cols];
        for k in 0..10 {
            let shift = 3 * (9 - k);
            for r in 0..step {
                for c in 0..cols {
                    let code = values[(k * step + r) * cols + c];
                    packed[r * cols + c] |= code << shift;
                }
            }
        }
        Ok(Tensor::from_vec(packed, (step, cols), device)?)
    }

    pub fn unpack_3bit_32(container: &Tensor, dtype: DType) -> Result<Tensor> {
        let dims = container.dims();
        let step = dims[0];
        let cols = dims[1];
        let words = container.to_dtype(DType::I32)?.flatten_all()?.to_vec1::<i32>()?;

        let mut unpacked = vec![0i32; step * 10 * cols];
        for k in 0..10 {
            let shift = 3 * (9 - k);
            for r in 0..step {
                for c in 0..cols {
                    let code = (words[r * cols + c] >> shift) & 0b111;
                    unpacked[(k * step + r) * cols + c] = code;
                }
            }
        }
        Tensor::from_vec(unpacked, (step * 10, cols), container.device())?.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn codes(values: &[u32], rows: usize, cols: usize) -> Tensor {
        Tensor::from_vec(values.to_vec(), (rows, cols), &Device::Cpu).unwrap()
    }

    #[test]
    fn pack_4bit_matches_literal_example() {
        // pack_4bit_u8([0,1,2,3, 4,5,6,7]) -> [0x04,0x15,0x26,0x37]
        let c = codes(&[0, 1, 2, 3, 4, 5, 6, 7], 8, 1);
        let packed = BitPack::pack_4bit_u8(&c).unwrap();
        let got: Vec<u8> = packed.to_dtype(DType::U8).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vec![0x04, 0x15, 0x26, 0x37]);

        let unpacked = BitPack::unpack_4bit_u8(&packed, DType::U32).unwrap();
        let got: Vec<u32> = unpacked.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vec![0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn pack_2bit_roundtrip_and_stripe_formula() {
        let c = codes(&[0, 1, 2, 3, 0, 1, 2, 3, 3, 2, 1, 0, 3, 2, 1, 0], 16, 1);
        let packed = BitPack::pack_2bit_u8(&c).unwrap();
        let got: Vec<u8> = packed.to_dtype(DType::U8).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        // a<<6 | b<<4 | c<<2 | d for stripes a=[0,1,2,3] b=[0,1,2,3] c=[3,2,1,0] d=[3,2,1,0]
        assert_eq!(got, vec![0x0F, 0x5A, 0xA5, 0xF0]);

        let unpacked = BitPack::unpack_2bit_u8(&packed, DType::U32).unwrap();
        let got: Vec<u32> = unpacked.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vec![0, 1, 2, 3, 0, 1, 2, 3, 3, 2, 1, 0, 3, 2, 1, 0]);
    }

    #[test]
    fn pack_1bit_roundtrip() {
        let vals: Vec<u32> = (0..16).map(|i| (i % 2) as u32).collect();
        let c = codes(&vals, 16, 1);
        let packed = BitPack::pack_1bit_u8(&c).unwrap();
        assert_eq!(packed.dims()[0], 2);
        let unpacked = BitPack::unpack_1bit_u8(&packed, DType::U32).unwrap();
        let got: Vec<u32> = unpacked.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vals);
    }

    #[test]
    fn pack_8bit_is_identity() {
        let vals: Vec<u32> = vec![0, 10, 255, 128];
        let c = codes(&vals, 4, 1);
        let packed = BitPack::pack_8bit_u8(&c).unwrap();
        let got: Vec<u8> = packed.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vec![0u8, 10, 255, 128]);
        let unpacked = BitPack::unpack_8bit_u8(&packed, DType::U32).unwrap();
        let got: Vec<u32> = unpacked.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vals);
    }

    #[test]
    fn pack_3bit_pads_to_multiple_of_ten() {
        // 7 rows of 2 codes each, values 0..6 (fit in 3 bits)
        let vals: Vec<u32> = (0..14).map(|i| i % 7).collect();
        let c = codes(&vals, 7, 2);
        let packed = BitPack::pack_3bit_32(&c).unwrap();
        assert_eq!(packed.dims(), &[1, 2]);
        assert_eq!(packed.dtype(), DType::I32);

        let unpacked = BitPack::unpack_3bit_32(&packed, DType::U32).unwrap();
        assert_eq!(unpacked.dims(), &[10, 2]);
        let got: Vec<u32> = unpacked.narrow(0, 0, 7).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vals);
    }

    #[test]
    fn pack_3bit_exact_multiple_needs_no_padding() {
        let vals: Vec<u32> = (0..20).map(|i| i % 7).collect();
        let c = codes(&vals, 10, 2);
        let packed = BitPack::pack_3bit_32(&c).unwrap();
        assert_eq!(packed.dims(), &[1, 2]);
        let unpacked = BitPack::unpack_3bit_32(&packed, DType::U32).unwrap();
        let got: Vec<u32> = unpacked.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vals);
    }

    #[test]
    fn pack_3bit_round_trips_full_code_range_every_stripe() {
        // 10 rows (one per stripe) x 4 columns, values spanning the full
        // 0..=7 range in every stripe so every 3-bit lane (including the
        // high bit, which the float32 path silently lost for shifts >= 24)
        // is exercised at every shift amount from 0 to 27.
        let rows = 10;
        let cols = 4;
        let vals: Vec<u32> = (0..rows * cols).map(|i| ((i * 5 + 3) % 8) as u32).collect();
        assert!(vals.contains(&7), "test fixture must exercise the top code");
        let c = codes(&vals, rows, cols);
        let packed = BitPack::pack_3bit_32(&c).unwrap();
        assert_eq!(packed.dims(), &[1, cols]);
        assert_eq!(packed.dtype(), DType::I32);

        let unpacked = BitPack::unpack_3bit_32(&packed, DType::U32).unwrap();
        let got: Vec<u32> = unpacked.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(got, vals);
    }
}
