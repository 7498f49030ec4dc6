//! Array wire format.
//!
//! Header: dimension count, has-nulls flag, element oid. Then per dimension
//! the element count and lower bound, then the elements row-major, each
//! prefixed with a four byte length where `-1` marks NULL.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{
    postgres::Oid,
    value::{Array, ArrayDim, Value},
};

use super::{Codec, DecodeError, EncodeError, need};

pub(crate) fn unpack(mut buf: Bytes, element_oid: Oid, element: &Codec) -> Result<Value, DecodeError> {
    need(&buf, 12, "array")?;
    let ndim = buf.get_i32();
    let _has_nulls = buf.get_i32();
    let wire_oid = buf.get_u32();

    if ndim < 0 {
        return Err(DecodeError::out_of_range("array"));
    }
    if wire_oid != element_oid {
        // codec was resolved for a different element type
        return Err(DecodeError::out_of_range("array"));
    }

    need(&buf, ndim as usize * 8, "array")?;
    let mut dims = Vec::with_capacity(ndim as usize);
    let mut total = 1usize;
    for _ in 0..ndim {
        let len = buf.get_i32();
        let lower = buf.get_i32();
        if len < 0 {
            return Err(DecodeError::out_of_range("array"));
        }
        total = total
            .checked_mul(len as usize)
            .ok_or(DecodeError::out_of_range("array"))?;
        dims.push(ArrayDim { len, lower });
    }
    if ndim == 0 {
        total = 0;
    }

    let mut elements = Vec::with_capacity(total);
    for _ in 0..total {
        need(&buf, 4, "array")?;
        let len = buf.get_i32();
        if len < 0 {
            elements.push(Value::Null);
            continue;
        }
        need(&buf, len as usize, "array")?;
        let blob = buf.split_to(len as usize);
        elements.push(element.decode(blob)?);
    }

    Ok(Value::Array(Array { element_oid, dims, elements }))
}

pub(crate) fn pack(
    value: &Array,
    element_oid: Oid,
    element: &Codec,
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    let expected: i64 = value.dims.iter().map(|d| d.len as i64).product();
    let expected = match value.dims.is_empty() {
        true => 0,
        false => expected,
    };
    if expected != value.elements.len() as i64 {
        return Err(EncodeError::out_of_range("array"));
    }

    buf.put_i32(value.dims.len() as i32);
    buf.put_i32(value.has_nulls() as i32);
    buf.put_u32(element_oid);
    for dim in &value.dims {
        buf.put_i32(dim.len);
        buf.put_i32(dim.lower);
    }

    for item in &value.elements {
        if item.is_null() {
            buf.put_i32(-1);
            continue;
        }
        // reserve the length word, encode, then patch it
        let at = buf.len();
        buf.put_i32(0);
        element.encode(item, buf)?;
        let len = (buf.len() - at - 4) as i32;
        buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::oid;
    use std::sync::Arc;

    fn int4_array() -> Codec {
        Codec::Array { element_oid: oid::INT4, element: Arc::new(Codec::Int4) }
    }

    fn roundtrip(value: Array) -> Array {
        let codec = int4_array();
        let mut buf = BytesMut::new();
        codec.encode(&Value::Array(value), &mut buf).unwrap();
        match codec.decode(buf.freeze()).unwrap() {
            Value::Array(array) => array,
            other => panic!("expected array, got {other:?}"),
        }
    }

    #[test]
    fn one_dimension_roundtrip() {
        let value = Array::from_vec(
            oid::INT4,
            vec![Value::Int4(1), Value::Null, Value::Int4(-3)],
        );
        let got = roundtrip(value.clone());
        assert_eq!(got, value);
        assert!(got.has_nulls());
    }

    #[test]
    fn two_dimensions_row_major() {
        // [[1,2],[3,4]]: shape (2,2), elements flattened leftmost-slowest
        let value = Array {
            element_oid: oid::INT4,
            dims: vec![ArrayDim { len: 2, lower: 1 }, ArrayDim { len: 2, lower: 1 }],
            elements: vec![Value::Int4(1), Value::Int4(2), Value::Int4(3), Value::Int4(4)],
        };
        let got = roundtrip(value.clone());
        assert_eq!(got.shape(), vec![2, 2]);
        assert_eq!(got, value);
    }

    #[test]
    fn empty_array() {
        let value = Array { element_oid: oid::INT4, dims: vec![], elements: vec![] };
        assert_eq!(roundtrip(value.clone()), value);
    }

    #[test]
    fn element_count_mismatch_rejected() {
        let bad = Array {
            element_oid: oid::INT4,
            dims: vec![ArrayDim { len: 3, lower: 1 }],
            elements: vec![Value::Int4(1)],
        };
        let mut buf = BytesMut::new();
        assert!(int4_array().encode(&Value::Array(bad), &mut buf).is_err());
    }
}
