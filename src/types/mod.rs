//! Binary codecs for postgres types.
//!
//! Every codec is a pure transformation between wire bytes and [`Value`].
//! Fixed-width integers are network byte order; everything else follows the
//! per-type binary send/recv format of the server.
use std::{borrow::Cow, sync::Arc};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    common::ByteStr,
    postgres::{Oid, PgFormat},
    value::Value,
};

pub(crate) mod array;
pub(crate) mod net;
pub(crate) mod numeric;
pub(crate) mod record;
pub(crate) mod temporal;
pub(crate) mod text;

/// A resolved wire codec for one type oid.
///
/// Composite and array codecs hold their child codecs resolved ahead of
/// time, so decoding never reaches back into the catalog.
#[derive(Debug, Clone)]
pub enum Codec {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Oid,
    /// `text`, `varchar`, `bpchar`, `name`: utf8 bytes either format.
    Text,
    Bytea,
    Numeric,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    TimeTz,
    Interval,
    Inet,
    Array {
        element_oid: Oid,
        element: Arc<Codec>,
    },
    Record {
        attributes: Arc<[CompositeAttr]>,
    },
    /// Text-format fallback for types without a binary codec on either side.
    TextFallback,
}

/// One attribute of a composite type.
#[derive(Debug, Clone)]
pub struct CompositeAttr {
    pub name: ByteStr,
    pub oid: Oid,
    pub codec: Arc<Codec>,
}

impl Codec {
    /// The format code this codec reads and writes.
    pub fn format(&self) -> PgFormat {
        match self {
            Codec::TextFallback => PgFormat::Text,
            _ => PgFormat::Binary,
        }
    }

    /// Type name used in error reports.
    pub fn name(&self) -> &'static str {
        match self {
            Codec::Bool => "bool",
            Codec::Int2 => "int2",
            Codec::Int4 => "int4",
            Codec::Int8 => "int8",
            Codec::Float4 => "float4",
            Codec::Float8 => "float8",
            Codec::Oid => "oid",
            Codec::Text => "text",
            Codec::Bytea => "bytea",
            Codec::Numeric => "numeric",
            Codec::Timestamp => "timestamp",
            Codec::TimestampTz => "timestamptz",
            Codec::Date => "date",
            Codec::Time => "time",
            Codec::TimeTz => "timetz",
            Codec::Interval => "interval",
            Codec::Inet => "inet",
            Codec::Array { .. } => "array",
            Codec::Record { .. } => "record",
            Codec::TextFallback => "text",
        }
    }

    /// Decode one non-NULL column or element value.
    pub fn decode(&self, mut buf: Bytes) -> Result<Value, DecodeError> {
        match self {
            Codec::Bool => {
                exact(&buf, 1, "bool")?;
                match buf.get_u8() {
                    0 => Ok(Value::Bool(false)),
                    1 => Ok(Value::Bool(true)),
                    _ => Err(DecodeError::out_of_range("bool")),
                }
            }
            Codec::Int2 => {
                exact(&buf, 2, "int2")?;
                Ok(Value::Int2(buf.get_i16()))
            }
            Codec::Int4 => {
                exact(&buf, 4, "int4")?;
                Ok(Value::Int4(buf.get_i32()))
            }
            Codec::Int8 => {
                exact(&buf, 8, "int8")?;
                Ok(Value::Int8(buf.get_i64()))
            }
            Codec::Float4 => {
                exact(&buf, 4, "float4")?;
                Ok(Value::Float4(buf.get_f32()))
            }
            Codec::Float8 => {
                exact(&buf, 8, "float8")?;
                Ok(Value::Float8(buf.get_f64()))
            }
            Codec::Oid => {
                exact(&buf, 4, "oid")?;
                Ok(Value::Oid(buf.get_u32()))
            }
            Codec::Text | Codec::TextFallback => Ok(Value::Text(
                ByteStr::from_utf8(buf).map_err(DecodeError::Utf8)?,
            )),
            Codec::Bytea => Ok(Value::Bytea(buf)),
            Codec::Numeric => numeric::unpack(buf),
            Codec::Timestamp => temporal::unpack_timestamp(buf),
            Codec::TimestampTz => temporal::unpack_timestamptz(buf),
            Codec::Date => temporal::unpack_date(buf),
            Codec::Time => temporal::unpack_time(buf),
            Codec::TimeTz => temporal::unpack_timetz(buf),
            Codec::Interval => temporal::unpack_interval(buf),
            Codec::Inet => net::unpack(buf),
            Codec::Array { element_oid, element } => array::unpack(buf, *element_oid, element),
            Codec::Record { attributes } => record::unpack(buf, attributes),
        }
    }

    /// Encode one non-NULL value.
    ///
    /// NULL never reaches a codec: the `Bind` serializer writes the `-1`
    /// length itself.
    pub fn encode(&self, value: &Value, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match (self, value) {
            (Codec::Bool, Value::Bool(v)) => buf.put_u8(*v as u8),
            (Codec::Int2, v) => buf.put_i16(int_param::<i16>(v, "int2")?),
            (Codec::Int4, v) => buf.put_i32(int_param::<i32>(v, "int4")?),
            (Codec::Int8, v) => buf.put_i64(int_param::<i64>(v, "int8")?),
            (Codec::Oid, Value::Oid(v)) => buf.put_u32(*v),
            (Codec::Oid, v) => {
                let wide = int_param::<i64>(v, "oid")?;
                let oid = u32::try_from(wide).map_err(|_| EncodeError::out_of_range("oid"))?;
                buf.put_u32(oid);
            }
            (Codec::Float4, Value::Float4(v)) => buf.put_f32(*v),
            (Codec::Float8, Value::Float8(v)) => buf.put_f64(*v),
            (Codec::Float8, Value::Float4(v)) => buf.put_f64((*v).into()),
            (Codec::Text, Value::Text(v)) => buf.put_slice(v.as_bytes()),
            (Codec::Bytea, Value::Bytea(v)) => buf.put_slice(v),
            (Codec::Numeric, Value::Numeric(v)) => numeric::pack(v, buf),
            (Codec::Timestamp, Value::Timestamp(v)) => temporal::pack_timestamp(*v, buf)?,
            (Codec::TimestampTz, Value::TimestampTz(v)) => temporal::pack_timestamptz(*v, buf)?,
            (Codec::Date, Value::Date(v)) => temporal::pack_date(*v, buf),
            (Codec::Time, Value::Time(v)) => temporal::pack_time(*v, buf),
            (Codec::TimeTz, Value::TimeTz(v, offset)) => temporal::pack_timetz(*v, *offset, buf),
            (Codec::Interval, Value::Interval(v)) => temporal::pack_interval(*v, buf),
            (Codec::Inet, Value::Inet(v)) => net::pack(v, buf),
            (Codec::Array { element_oid, element }, Value::Array(v)) => {
                array::pack(v, *element_oid, element, buf)?
            }
            (Codec::Record { attributes }, Value::Record(v)) => record::pack(v, attributes, buf)?,
            (Codec::TextFallback, v) => {
                let rendered = text::render(v)?;
                buf.put_slice(rendered.as_bytes());
            }
            (codec, value) => {
                return Err(EncodeError::type_mismatch(codec.name(), value.kind()));
            }
        }
        Ok(())
    }
}

/// Convert an integer flavored [`Value`] with range checking.
///
/// Overflow is the *parameter-range* failure.
fn int_param<T>(value: &Value, ty: &'static str) -> Result<T, EncodeError>
where
    T: TryFrom<i64>,
{
    let wide = match value {
        Value::Int2(v) => i64::from(*v),
        Value::Int4(v) => i64::from(*v),
        Value::Int8(v) => *v,
        Value::Oid(v) => i64::from(*v),
        other => return Err(EncodeError::type_mismatch(ty, other.kind())),
    };
    T::try_from(wide).map_err(|_| EncodeError::out_of_range(ty))
}

/// The value must hold exactly `len` bytes.
pub(crate) fn exact(buf: &Bytes, len: usize, ty: &'static str) -> Result<(), DecodeError> {
    if buf.len() != len {
        return Err(DecodeError::SizeMismatch { ty, expected: len, got: buf.len() });
    }
    Ok(())
}

/// The value must hold at least `len` more bytes.
pub(crate) fn need(buf: &Bytes, len: usize, ty: &'static str) -> Result<(), DecodeError> {
    if buf.len() < len {
        return Err(DecodeError::SizeMismatch { ty, expected: len, got: buf.len() });
    }
    Ok(())
}

/// An error when decoding a wire value.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The input is shorter (or longer) than the type requires.
    #[error("{ty}: expected {expected} bytes, got {got}")]
    SizeMismatch {
        ty: &'static str,
        expected: usize,
        got: usize,
    },
    /// The wire value falls outside the target representation.
    #[error("{ty}: value out of range")]
    OutOfRange { ty: &'static str },
    /// A [`Value`] variant that does not convert into the requested type.
    #[error("expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid utf8 in character data: {0}")]
    Utf8(std::str::Utf8Error),
    #[error("column not found: {0}")]
    ColumnNotFound(Cow<'static, str>),
    /// Same failure, annotated with the column it happened in.
    #[error("column {index} ({column}): {source}")]
    Column {
        column: ByteStr,
        index: usize,
        source: Box<DecodeError>,
    },
}

impl DecodeError {
    pub(crate) fn out_of_range(ty: &'static str) -> Self {
        Self::OutOfRange { ty }
    }

    pub(crate) fn type_mismatch(expected: &'static str, found: &'static str) -> Self {
        Self::TypeMismatch { expected, found }
    }

    pub(crate) fn in_column(self, column: ByteStr, index: usize) -> Self {
        match self {
            already @ Self::Column { .. } => already,
            source => Self::Column { column, index, source: Box::new(source) },
        }
    }
}

/// An error when encoding a parameter.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// The value does not fit the declared parameter type.
    #[error("{ty}: value out of range")]
    OutOfRange { ty: &'static str },
    #[error("cannot encode {found} as {expected}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },
    /// Same failure, annotated with the parameter position.
    #[error("parameter ${position}: {source}")]
    Parameter {
        /// One-based, like in the statement text.
        position: usize,
        source: Box<EncodeError>,
    },
    /// Statement declared a different number of parameters.
    #[error("statement takes {expected} parameters, {got} were bound")]
    Arity { expected: usize, got: usize },
}

impl EncodeError {
    pub(crate) fn out_of_range(ty: &'static str) -> Self {
        Self::OutOfRange { ty }
    }

    pub(crate) fn type_mismatch(expected: &'static str, found: &'static str) -> Self {
        Self::TypeMismatch { expected, found }
    }

    pub(crate) fn at_parameter(self, position: usize) -> Self {
        match self {
            already @ Self::Parameter { .. } => already,
            source => Self::Parameter { position, source: Box::new(source) },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(codec: &Codec, value: Value) -> Value {
        let mut buf = BytesMut::new();
        codec.encode(&value, &mut buf).unwrap();
        codec.decode(buf.freeze()).unwrap()
    }

    #[test]
    fn integer_roundtrip() {
        assert_eq!(roundtrip(&Codec::Int2, Value::Int2(-12345)), Value::Int2(-12345));
        assert_eq!(roundtrip(&Codec::Int4, Value::Int4(i32::MIN)), Value::Int4(i32::MIN));
        assert_eq!(roundtrip(&Codec::Int8, Value::Int8(i64::MAX)), Value::Int8(i64::MAX));
    }

    #[test]
    fn integer_widening_and_overflow() {
        // widening on pack is fine
        assert_eq!(roundtrip(&Codec::Int8, Value::Int2(7)), Value::Int8(7));
        // narrowing overflow is a parameter-range error
        let mut buf = BytesMut::new();
        let err = Codec::Int2.encode(&Value::Int4(70_000), &mut buf).unwrap_err();
        assert!(matches!(err, EncodeError::OutOfRange { ty: "int2" }));
    }

    #[test]
    fn float_bit_exact() {
        let Value::Float8(nan) = roundtrip(&Codec::Float8, Value::Float8(f64::NAN)) else {
            panic!()
        };
        assert_eq!(nan.to_bits(), f64::NAN.to_bits());
        assert_eq!(
            roundtrip(&Codec::Float4, Value::Float4(f32::NEG_INFINITY)),
            Value::Float4(f32::NEG_INFINITY),
        );
        assert_eq!(
            roundtrip(&Codec::Float8, Value::Float8(-0.0)),
            Value::Float8(-0.0),
        );
    }

    #[test]
    fn bool_strict_octets() {
        assert_eq!(roundtrip(&Codec::Bool, Value::Bool(true)), Value::Bool(true));
        let err = Codec::Bool.decode(Bytes::from_static(&[2])).unwrap_err();
        assert!(matches!(err, DecodeError::OutOfRange { .. }));
    }

    #[test]
    fn short_input_reports_size() {
        let err = Codec::Int4.decode(Bytes::from_static(&[0, 1])).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::SizeMismatch { ty: "int4", expected: 4, got: 2 }
        ));
    }

    #[test]
    fn type_mismatch_on_wrong_variant() {
        let mut buf = BytesMut::new();
        let err = Codec::Bool.encode(&Value::Int4(1), &mut buf).unwrap_err();
        assert!(matches!(err, EncodeError::TypeMismatch { .. }));
    }
}
