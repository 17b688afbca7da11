use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{QuantError, Result};

/// Supported integer widths. A closed sum type rather than a bare `f64` so
/// the `nbits -> packing` mapping is an exhaustive `match` instead of a
/// runtime float comparison; 1.58 (ternary) is its own variant because it is
/// the only non-integer member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NBits {
    One,
    OnePointFiveEight,
    Two,
    Three,
    Four,
    Five,
    Six,
    Eight,
}

impl NBits {
    pub const ALL: [NBits; 8] = [
        NBits::One,
        NBits::OnePointFiveEight,
        NBits::Two,
        NBits::Three,
        NBits::Four,
        NBits::Five,
        NBits::Six,
        NBits::Eight,
    ];

    /// The nominal bit width as it appears in `nbits ∈ {1, 1.58, 2, 3, 4, 5, 6, 8}`.
    pub fn value(&self) -> f64 {
        match self {
            NBits::One => 1.0,
            NBits::OnePointFiveEight => 1.58,
            NBits::Two => 2.0,
            NBits::Three => 3.0,
            NBits::Four => 4.0,
            NBits::Five => 5.0,
            NBits::Six => 6.0,
            NBits::Eight => 8.0,
        }
    }

    /// `max_v = round(2^nbits - 1)`. Codes range over `[0, max_v]`.
    pub fn max_v(&self) -> i64 {
        (2f64.powf(self.value()) - 1.0).round() as i64
    }

    /// The packing identifier this width maps to.
    pub fn packing(&self) -> Packing {
        match self {
            NBits::One => Packing::U8Oct,
            NBits::OnePointFiveEight => Packing::U8Quad,
            NBits::Two => Packing::U8Quad,
            NBits::Three => Packing::I32Deca,
            NBits::Four => Packing::U8Nibble,
            NBits::Five | NBits::Six | NBits::Eight => Packing::U8Identity,
        }
    }

    pub fn from_value(value: f64) -> Result<Self> {
        NBits::ALL
            .into_iter()
            .find(|n| (n.value() - value).abs() < 1e-6)
            .ok_or_else(|| {
                QuantError::UnsupportedConfiguration(format!("nbits={value} not supported"))
            })
    }
}

/// Grouping / reduction axis. Only 0 and 1 are valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Zero = 0,
    One = 1,
}

impl Axis {
    pub fn as_usize(&self) -> usize {
        *self as usize
    }

    pub fn from_usize(axis: usize) -> Result<Self> {
        match axis {
            0 => Ok(Axis::Zero),
            1 => Ok(Axis::One),
            other => Err(QuantError::UnsupportedConfiguration(format!(
                "axis should be either 0 or 1, got {other}"
            ))),
        }
    }
}

/// Closed set of packing codecs, keyed by their container/ratio identifiers.
/// An exhaustive enum rather than a string-keyed dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Packing {
    U8Identity,
    U8Nibble,
    U8Quad,
    U8Oct,
    I32Deca,
}

impl Packing {
    /// Codes packed per container element.
    pub fn ratio(&self) -> usize {
        match self {
            Packing::U8Identity => 1,
            Packing::U8Nibble => 2,
            Packing::U8Quad => 4,
            Packing::U8Oct => 8,
            Packing::I32Deca => 10,
        }
    }

    /// Bit width of one packed code (not the container width).
    pub fn code_bits(&self) -> u32 {
        match self {
            Packing::U8Identity => 8,
            Packing::U8Nibble => 4,
            Packing::U8Quad => 2,
            Packing::U8Oct => 1,
            Packing::I32Deca => 3,
        }
    }

    pub fn container_dtype(&self) -> DType {
        match self {
            Packing::I32Deca => DType::I32,
            _ => DType::U8,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Packing::U8Identity => "8bit_u8",
            Packing::U8Nibble => "4bit_u8",
            Packing::U8Quad => "2bit_u8",
            Packing::U8Oct => "1bit_u8",
            Packing::I32Deca => "3bit_32",
        }
    }
}

/// Deprecated host-surface fields that must be accepted and silently
/// ignored for backward compatibility. Never read by this crate beyond the
/// one-time warning in [`crate::quantize::warn_if_deprecated`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeprecatedHostFields {
    pub scale_quant_params: Option<serde_json::Value>,
    pub zero_quant_params: Option<serde_json::Value>,
    pub offload_meta: Option<serde_json::Value>,
}

impl DeprecatedHostFields {
    pub fn any_present(&self) -> bool {
        self.scale_quant_params.is_some()
            || self.zero_quant_params.is_some()
            || self.offload_meta.is_some()
    }
}

/// Host-facing quantization configuration: the per-tensor knobs a caller
/// chooses (`nbits`, `channel_wise`, `group_size`, `optimize`, `round_zero`,
/// `axis`, `view_as_float`) plus the orchestration-only `bitpack`/
/// `compute_dtype` fields.
#[derive(Debug, Clone)]
pub struct WeightQuantParams {
    pub nbits: NBits,
    pub channel_wise: bool,
    pub group_size: Option<usize>,
    pub optimize: bool,
    pub round_zero: bool,
    pub axis: Axis,
    pub bitpack: bool,
    pub compute_dtype: Option<DType>,
    pub view_as_float: bool,
    pub deprecated: DeprecatedHostFields,
}

#[buildstructor::buildstructor]
impl WeightQuantParams {
    /// `channel_wise = false` forces `optimize = false`: a single global
    /// scale/zero is too coarse for the proximal refinement to help.
    #[builder]
    pub fn new(
        nbits: NBits,
        axis: Axis,
        channel_wise: Option<bool>,
        group_size: Option<usize>,
        optimize: Option<bool>,
        round_zero: Option<bool>,
        bitpack: Option<bool>,
        compute_dtype: Option<DType>,
        view_as_float: Option<bool>,
        deprecated: Option<DeprecatedHostFields>,
    ) -> Self {
        let channel_wise = channel_wise.unwrap_or(true);
        let optimize = channel_wise && optimize.unwrap_or(true);
        Self {
            nbits,
            channel_wise,
            group_size,
            optimize,
            round_zero: round_zero.unwrap_or(false),
            axis,
            bitpack: bitpack.unwrap_or(true),
            compute_dtype,
            view_as_float: view_as_float.unwrap_or(false),
            deprecated: deprecated.unwrap_or_default(),
        }
    }
}

/// Configuration record bound to a packed tensor, required to reconstruct it.
#[derive(Debug, Clone)]
pub struct Meta {
    pub nbits: NBits,
    pub group_size: Option<usize>,
    pub shape: Vec<usize>,
    pub scale: Tensor,
    pub zero: Tensor,
    pub axis: Axis,
    pub packing: Option<Packing>,
    pub unpack_view_dtype: DType,
    pub view_as_float: bool,
    pub compute_dtype: DType,
}


impl Meta {
    /// A human/host-readable view of the non-tensor fields. Tensor fields
    /// (`scale`, `zero`) are not included: serializing tensor payloads is a
    /// persistence-format concern this crate doesn't own.
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "nbits": self.nbits.value(),
            "group_size": self.group_size,
            "shape": self.shape,
            "axis": self.axis.as_usize(),
            "packing": self.packing.map(|p| p.id()),
            "unpack_view_dtype": format!("{:?}", self.unpack_view_dtype),
            "view_as_float": self.view_as_float,
            "compute_dtype": format!("{:?}", self.compute_dtype),
        })
    }
}
