//! Half-quadratic post-training weight quantizer for dense linear layers.
//!
//! Given a real weight tensor `W`, [`quantize`] produces a packed integer
//! codebook `(W_q_packed, meta)` such that `(W_q - zero) * scale`
//! reconstructs `W` with minimum sparse-residual error. [`dequantize`]
//! reverses the process. The heavy lifting is [`optimize`]'s half-quadratic
//! proximal solver and [`bitpack`]'s sub-byte codecs; [`quantize`] (the
//! module) wires group reshaping, the initial affine codebook, and the two
//! together.
//!
//! This crate binds directly to `candle_core::Tensor` rather than an
//! abstract tensor trait: there is exactly one numeric runtime this crate's
//! callers use, and a trait indirection here would only add a layer with no
//! second implementation behind it.

pub mod bitpack;
pub mod error;
pub mod meta;
pub mod optimize;
pub mod quantize;
mod utils;

pub use bitpack::BitPack;
pub use error::{QuantError, Result};
pub use meta::{Axis, DeprecatedHostFields, Meta, NBits, Packing, WeightQuantParams};
pub use optimize::{optimize_weights_proximal, OptParams};
pub use quantize::{dequantize, quantize};
