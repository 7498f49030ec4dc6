//! Typed postgres values.
//!
//! Every decoded column and every bound parameter passes through [`Value`].
//! The wire representation is chosen by the codec resolved for the column
//! or parameter oid, see [`crate::registry`].
use bytes::Bytes;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::{
    common::ByteStr,
    postgres::Oid,
    types::DecodeError,
};

/// A single typed value.
///
/// `Null` is the distinguished NULL sentinel: a NULL column decodes to it
/// regardless of the column type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// `text`, `varchar`, `bpchar`, `name`, and any type read in text format.
    Text(ByteStr),
    Bytea(Bytes),
    Numeric(Numeric),
    Timestamp(PrimitiveDateTime),
    TimestampTz(OffsetDateTime),
    Date(Date),
    Time(Time),
    TimeTz(Time, UtcOffset),
    Interval(Interval),
    Inet(Inet),
    Array(Array),
    Record(Record),
    Oid(Oid),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Name of the variant, used in error reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int2(_) => "int2",
            Value::Int4(_) => "int4",
            Value::Int8(_) => "int8",
            Value::Float4(_) => "float4",
            Value::Float8(_) => "float8",
            Value::Text(_) => "text",
            Value::Bytea(_) => "bytea",
            Value::Numeric(_) => "numeric",
            Value::Timestamp(_) => "timestamp",
            Value::TimestampTz(_) => "timestamptz",
            Value::Date(_) => "date",
            Value::Time(_) => "time",
            Value::TimeTz(..) => "timetz",
            Value::Interval(_) => "interval",
            Value::Inet(_) => "inet",
            Value::Array(_) => "array",
            Value::Record(_) => "record",
            Value::Oid(_) => "oid",
        }
    }
}

/// Arbitrary precision decimal in the server's wire shape.
///
/// `digits` are base-10000 digits, most significant first. `weight` is the
/// base-10000 exponent of the first digit. `dscale` is the number of
/// decimal (base-10) digits after the point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Numeric {
    pub sign: NumericSign,
    pub weight: i16,
    pub dscale: u16,
    pub digits: Vec<i16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericSign {
    Positive,
    Negative,
    NaN,
    PositiveInfinity,
    NegativeInfinity,
}

impl Numeric {
    pub const NAN: Numeric = Numeric {
        sign: NumericSign::NaN,
        weight: 0,
        dscale: 0,
        digits: Vec::new(),
    };

    pub fn is_finite(&self) -> bool {
        matches!(self.sign, NumericSign::Positive | NumericSign::Negative)
    }
}

impl From<i64> for Numeric {
    fn from(value: i64) -> Self {
        let sign = match value < 0 {
            true => NumericSign::Negative,
            false => NumericSign::Positive,
        };
        let mut digits = Vec::new();
        let mut mag = value.unsigned_abs();
        while mag != 0 {
            digits.insert(0, (mag % 10000) as i16);
            mag /= 10000;
        }
        let weight = (digits.len() as i16 - 1).max(0);
        Numeric { sign, weight, dscale: 0, digits }
    }
}

/// `interval`: months, days and microseconds are carried separately
/// because their ratios depend on the calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interval {
    pub months: i32,
    pub days: i32,
    pub micros: i64,
}

/// `inet` and `cidr`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inet {
    pub addr: std::net::IpAddr,
    /// Network prefix length in bits.
    pub prefix: u8,
    pub is_cidr: bool,
}

impl Inet {
    pub fn host(addr: std::net::IpAddr) -> Self {
        let prefix = match addr {
            std::net::IpAddr::V4(_) => 32,
            std::net::IpAddr::V6(_) => 128,
        };
        Self { addr, prefix, is_cidr: false }
    }
}

/// One dimension of an [`Array`]: element count and lower bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayDim {
    pub len: i32,
    pub lower: i32,
}

/// A postgres array of any dimensionality.
///
/// Elements are stored row-major, leftmost dimension varying slowest.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    pub element_oid: Oid,
    pub dims: Vec<ArrayDim>,
    pub elements: Vec<Value>,
}

impl Array {
    /// One dimensional array with default lower bound.
    pub fn from_vec(element_oid: Oid, elements: Vec<Value>) -> Self {
        Self {
            element_oid,
            dims: vec![ArrayDim { len: elements.len() as i32, lower: 1 }],
            elements,
        }
    }

    /// Element counts per dimension.
    pub fn shape(&self) -> Vec<i32> {
        self.dims.iter().map(|d| d.len).collect()
    }

    pub fn has_nulls(&self) -> bool {
        self.elements.iter().any(Value::is_null)
    }
}

/// An anonymous record or a declared composite value.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub fields: Vec<RecordField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordField {
    /// Attribute name; `None` for anonymous records.
    pub name: Option<ByteStr>,
    pub oid: Oid,
    pub value: Value,
}

impl Record {
    /// Field value by attribute name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|f| f.name.as_deref() == Some(name))
            .map(|f| &f.value)
    }
}

// ===== Into conversions, parameter side =====

macro_rules! value_from {
    ($($ty:ty => $variant:ident,)*) => {$(
        impl From<$ty> for Value {
            fn from(value: $ty) -> Value {
                Value::$variant(value.into())
            }
        }
    )*};
}

value_from! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    Bytes => Bytea,
    Numeric => Numeric,
    PrimitiveDateTime => Timestamp,
    OffsetDateTime => TimestampTz,
    Date => Date,
    Time => Time,
    Interval => Interval,
    Inet => Inet,
    Array => Array,
    Record => Record,
}

impl From<&str> for Value {
    fn from(value: &str) -> Value {
        Value::Text(ByteStr::copy_from_str(value))
    }
}

impl From<ByteStr> for Value {
    fn from(value: ByteStr) -> Value {
        Value::Text(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Value {
        Value::Bytea(value.into())
    }
}

impl From<std::net::IpAddr> for Value {
    fn from(value: std::net::IpAddr) -> Value {
        Value::Inet(Inet::host(value))
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Value {
        match value {
            Some(value) => value.into(),
            None => Value::Null,
        }
    }
}

// ===== TryFrom conversions, result side =====

macro_rules! value_try_into {
    ($($ty:ty: $name:literal => { $($pat:pat => $body:expr,)* },)*) => {$(
        impl TryFrom<Value> for $ty {
            type Error = DecodeError;

            fn try_from(value: Value) -> Result<$ty, DecodeError> {
                match value {
                    $($pat => $body,)*
                    other => Err(DecodeError::type_mismatch($name, other.kind())),
                }
            }
        }
    )*};
}

value_try_into! {
    bool: "bool" => {
        Value::Bool(v) => Ok(v),
    },
    i16: "int2" => {
        Value::Int2(v) => Ok(v),
    },
    i32: "int4" => {
        Value::Int4(v) => Ok(v),
        Value::Int2(v) => Ok(v.into()),
    },
    i64: "int8" => {
        Value::Int8(v) => Ok(v),
        Value::Int4(v) => Ok(v.into()),
        Value::Int2(v) => Ok(v.into()),
        Value::Oid(v) => Ok(v.into()),
    },
    f32: "float4" => {
        Value::Float4(v) => Ok(v),
    },
    f64: "float8" => {
        Value::Float8(v) => Ok(v),
        Value::Float4(v) => Ok(v.into()),
    },
    String: "text" => {
        Value::Text(v) => Ok(v.as_str().to_owned()),
    },
    ByteStr: "text" => {
        Value::Text(v) => Ok(v),
    },
    Bytes: "bytea" => {
        Value::Bytea(v) => Ok(v),
        Value::Text(v) => Ok(v.into_bytes()),
    },
    Numeric: "numeric" => {
        Value::Numeric(v) => Ok(v),
    },
    Interval: "interval" => {
        Value::Interval(v) => Ok(v),
    },
    Inet: "inet" => {
        Value::Inet(v) => Ok(v),
    },
    Array: "array" => {
        Value::Array(v) => Ok(v),
    },
    Record: "record" => {
        Value::Record(v) => Ok(v),
    },
    PrimitiveDateTime: "timestamp" => {
        Value::Timestamp(v) => Ok(v),
    },
    OffsetDateTime: "timestamptz" => {
        Value::TimestampTz(v) => Ok(v),
    },
    Date: "date" => {
        Value::Date(v) => Ok(v),
    },
    Time: "time" => {
        Value::Time(v) => Ok(v),
    },
    Oid: "oid" => {
        Value::Oid(v) => Ok(v),
    },
}

impl<T: TryFrom<Value, Error = DecodeError>> TryFrom<Value> for Option<T> {
    type Error = DecodeError;

    fn try_from(value: Value) -> Result<Option<T>, DecodeError> {
        match value {
            Value::Null => Ok(None),
            value => T::try_from(value).map(Some),
        }
    }
}
