//! Coordinate datatypes and the dispatch machinery built on them.
//!
//! Every index shares one coordinate datatype across all of its dimensions.
//! The supported types are modeled as a tagged [`Datatype`] enum plus the
//! [`CoordValue`] trait implemented by the ten concrete Rust types. Geometric
//! routines are written once, generically, and monomorphized; public entry
//! points dispatch on the tag exactly once per operation via
//! `dispatch_datatype!`.

use serde::{Deserialize, Serialize};

use crate::error::{CelldexError, Result};

/// Coordinate datatype of an array domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Datatype {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
}

impl Datatype {
    /// Size of one coordinate value in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Datatype::Int8 | Datatype::UInt8 => 1,
            Datatype::Int16 | Datatype::UInt16 => 2,
            Datatype::Int32 | Datatype::UInt32 | Datatype::Float32 => 4,
            Datatype::Int64 | Datatype::UInt64 | Datatype::Float64 => 8,
        }
    }

    /// `true` for the eight integer datatypes.
    pub fn is_integer(&self) -> bool {
        !matches!(self, Datatype::Float32 | Datatype::Float64)
    }
}

impl std::fmt::Display for Datatype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Datatype::Int8 => "int8",
            Datatype::Int16 => "int16",
            Datatype::Int32 => "int32",
            Datatype::Int64 => "int64",
            Datatype::UInt8 => "uint8",
            Datatype::UInt16 => "uint16",
            Datatype::UInt32 => "uint32",
            Datatype::UInt64 => "uint64",
            Datatype::Float32 => "float32",
            Datatype::Float64 => "float64",
        };
        f.write_str(name)
    }
}

/// Run `$body` with `$T` bound to the concrete type for `$dt`.
///
/// This is the single run-time dispatch point: everything downstream is
/// monomorphized.
macro_rules! dispatch_datatype {
    ($dt:expr, $T:ident => $body:block) => {
        match $dt {
            $crate::datatype::Datatype::Int8 => {
                type $T = i8;
                $body
            }
            $crate::datatype::Datatype::Int16 => {
                type $T = i16;
                $body
            }
            $crate::datatype::Datatype::Int32 => {
                type $T = i32;
                $body
            }
            $crate::datatype::Datatype::Int64 => {
                type $T = i64;
                $body
            }
            $crate::datatype::Datatype::UInt8 => {
                type $T = u8;
                $body
            }
            $crate::datatype::Datatype::UInt16 => {
                type $T = u16;
                $body
            }
            $crate::datatype::Datatype::UInt32 => {
                type $T = u32;
                $body
            }
            $crate::datatype::Datatype::UInt64 => {
                type $T = u64;
                $body
            }
            $crate::datatype::Datatype::Float32 => {
                type $T = f32;
                $body
            }
            $crate::datatype::Datatype::Float64 => {
                type $T = f64;
                $body
            }
        }
    };
}

pub(crate) use dispatch_datatype;

/// A contiguous buffer of coordinate values tagged with their datatype.
///
/// Levels of the R-tree, domain bounds, and subarray ranges all store their
/// coordinates in one of these. The tag is fixed at construction; typed
/// access goes through [`CoordValue::data_slice`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordData {
    Int8(Vec<i8>),
    Int16(Vec<i16>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    UInt8(Vec<u8>),
    UInt16(Vec<u16>),
    UInt32(Vec<u32>),
    UInt64(Vec<u64>),
    Float32(Vec<f32>),
    Float64(Vec<f64>),
}

impl CoordData {
    /// Allocate an empty buffer of the given datatype.
    pub fn new(datatype: Datatype) -> Self {
        match datatype {
            Datatype::Int8 => CoordData::Int8(Vec::new()),
            Datatype::Int16 => CoordData::Int16(Vec::new()),
            Datatype::Int32 => CoordData::Int32(Vec::new()),
            Datatype::Int64 => CoordData::Int64(Vec::new()),
            Datatype::UInt8 => CoordData::UInt8(Vec::new()),
            Datatype::UInt16 => CoordData::UInt16(Vec::new()),
            Datatype::UInt32 => CoordData::UInt32(Vec::new()),
            Datatype::UInt64 => CoordData::UInt64(Vec::new()),
            Datatype::Float32 => CoordData::Float32(Vec::new()),
            Datatype::Float64 => CoordData::Float64(Vec::new()),
        }
    }

    /// Datatype tag of this buffer.
    pub fn datatype(&self) -> Datatype {
        match self {
            CoordData::Int8(_) => Datatype::Int8,
            CoordData::Int16(_) => Datatype::Int16,
            CoordData::Int32(_) => Datatype::Int32,
            CoordData::Int64(_) => Datatype::Int64,
            CoordData::UInt8(_) => Datatype::UInt8,
            CoordData::UInt16(_) => Datatype::UInt16,
            CoordData::UInt32(_) => Datatype::UInt32,
            CoordData::UInt64(_) => Datatype::UInt64,
            CoordData::Float32(_) => Datatype::Float32,
            CoordData::Float64(_) => Datatype::Float64,
        }
    }

    /// Number of coordinate values held.
    pub fn len(&self) -> usize {
        dispatch_datatype!(self.datatype(), T => { T::data_slice(self).len() })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append every value, little-endian, to `out`.
    pub fn write_le(&self, out: &mut Vec<u8>) {
        dispatch_datatype!(self.datatype(), T => {
            for v in T::data_slice(self) {
                v.write_le(out);
            }
        })
    }

    /// Decode `count` little-endian values of `datatype` from `bytes`.
    pub fn read_le(datatype: Datatype, bytes: &[u8], count: usize) -> Result<Self> {
        let value_size = datatype.size() as usize;
        if bytes.len() < count * value_size {
            return Err(CelldexError::invalid(format!(
                "cannot decode {} values of type {}; got {} bytes",
                count,
                datatype,
                bytes.len()
            )));
        }
        dispatch_datatype!(datatype, T => {
            let mut values = Vec::with_capacity(count);
            for chunk in bytes[..count * value_size].chunks_exact(value_size) {
                values.push(T::read_le(chunk));
            }
            Ok(T::data_vec(values))
        })
    }
}

/// A concrete coordinate type.
///
/// Arithmetic helpers are written so that no intermediate value overflows the
/// native type: spans widen through `i128`/`u128`, midpoints are computed on
/// the widened difference.
pub trait CoordValue:
    Copy + PartialOrd + PartialEq + std::fmt::Display + std::fmt::Debug + Send + Sync + 'static
{
    const DATATYPE: Datatype;
    const IS_INTEGER: bool;

    /// Lossy widening to `f64`, used for overlap ratios.
    fn to_f64(self) -> f64;

    /// Decode one value from a little-endian byte chunk of exactly
    /// `DATATYPE.size()` bytes.
    fn read_le(bytes: &[u8]) -> Self;

    /// Append this value, little-endian, to `out`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Number of integer cells in the closed interval `[lo, hi]`, widened to
    /// `u128`. Unused for float types.
    fn span_cells(lo: Self, hi: Self) -> u128;

    /// `hi - lo` as `f64`; the half-open extent for float types.
    fn span(lo: Self, hi: Self) -> f64;

    /// `lo + (hi - lo) / 2`, computed without overflow. For `lo <= hi` the
    /// result lies in `[lo, hi)` unless the interval is a single point.
    /// Named to stay clear of the inherent `midpoint` on primitives.
    fn split_midpoint(lo: Self, hi: Self) -> Self;

    /// The value immediately after `x`: `x + 1` for integers, the next
    /// representable float otherwise. Callers guarantee `x` is below the
    /// domain maximum.
    fn split_successor(x: Self) -> Self;

    /// `true` only for float NaN.
    fn is_nan(self) -> bool {
        let _ = self;
        false
    }

    /// Typed view into a tagged buffer. Panics via `unreachable!` only on a
    /// tag mismatch, which indicates a crate-internal bug.
    fn data_slice(data: &CoordData) -> &[Self];

    /// Wrap a typed vector into a tagged buffer.
    fn data_vec(values: Vec<Self>) -> CoordData;
}

macro_rules! impl_coord_int {
    ($t:ty, $dt:expr, $variant:ident) => {
        impl CoordValue for $t {
            const DATATYPE: Datatype = $dt;
            const IS_INTEGER: bool = true;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn read_le(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes.try_into().expect("chunk size checked by caller"))
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn span_cells(lo: Self, hi: Self) -> u128 {
                (hi as i128 - lo as i128) as u128 + 1
            }

            fn span(lo: Self, hi: Self) -> f64 {
                (hi as i128 - lo as i128) as f64
            }

            fn split_midpoint(lo: Self, hi: Self) -> Self {
                (lo as i128 + (hi as i128 - lo as i128) / 2) as $t
            }

            fn split_successor(x: Self) -> Self {
                x + 1
            }

            fn data_slice(data: &CoordData) -> &[Self] {
                match data {
                    CoordData::$variant(v) => v,
                    other => unreachable!(
                        "coordinate buffer holds {} where {} was expected",
                        other.datatype(),
                        $dt
                    ),
                }
            }

            fn data_vec(values: Vec<Self>) -> CoordData {
                CoordData::$variant(values)
            }
        }
    };
}

macro_rules! impl_coord_float {
    ($t:ty, $dt:expr, $variant:ident) => {
        impl CoordValue for $t {
            const DATATYPE: Datatype = $dt;
            const IS_INTEGER: bool = false;

            fn to_f64(self) -> f64 {
                self as f64
            }

            fn read_le(bytes: &[u8]) -> Self {
                <$t>::from_le_bytes(bytes.try_into().expect("chunk size checked by caller"))
            }

            fn write_le(self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.to_le_bytes());
            }

            fn span_cells(_lo: Self, _hi: Self) -> u128 {
                0
            }

            fn span(lo: Self, hi: Self) -> f64 {
                (hi - lo) as f64
            }

            fn split_midpoint(lo: Self, hi: Self) -> Self {
                lo + (hi - lo) / 2.0
            }

            fn split_successor(x: Self) -> Self {
                x.next_up()
            }

            fn is_nan(self) -> bool {
                <$t>::is_nan(self)
            }

            fn data_slice(data: &CoordData) -> &[Self] {
                match data {
                    CoordData::$variant(v) => v,
                    other => unreachable!(
                        "coordinate buffer holds {} where {} was expected",
                        other.datatype(),
                        $dt
                    ),
                }
            }

            fn data_vec(values: Vec<Self>) -> CoordData {
                CoordData::$variant(values)
            }
        }
    };
}

impl_coord_int!(i8, Datatype::Int8, Int8);
impl_coord_int!(i16, Datatype::Int16, Int16);
impl_coord_int!(i32, Datatype::Int32, Int32);
impl_coord_int!(i64, Datatype::Int64, Int64);
impl_coord_int!(u8, Datatype::UInt8, UInt8);
impl_coord_int!(u16, Datatype::UInt16, UInt16);
impl_coord_int!(u32, Datatype::UInt32, UInt32);
impl_coord_int!(u64, Datatype::UInt64, UInt64);
impl_coord_float!(f32, Datatype::Float32, Float32);
impl_coord_float!(f64, Datatype::Float64, Float64);
