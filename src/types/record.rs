//! Composite (row type) wire format.
//!
//! A count of attributes, then per attribute its type oid and a length
//! prefixed blob, `-1` for NULL.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::value::{Record, RecordField, Value};

use super::{CompositeAttr, DecodeError, EncodeError, need};

pub(crate) fn unpack(mut buf: Bytes, attributes: &[CompositeAttr]) -> Result<Value, DecodeError> {
    need(&buf, 4, "record")?;
    let natts = buf.get_u32() as usize;
    if natts != attributes.len() {
        return Err(DecodeError::out_of_range("record"));
    }

    let mut fields = Vec::with_capacity(natts);
    for attr in attributes {
        need(&buf, 8, "record")?;
        let oid = buf.get_u32();
        let len = buf.get_i32();

        let value = match len < 0 {
            true => Value::Null,
            false => {
                need(&buf, len as usize, "record")?;
                let blob = buf.split_to(len as usize);
                attr.codec
                    .decode(blob)
                    .map_err(|e| e.in_column(attr.name.clone(), fields.len()))?
            }
        };

        fields.push(RecordField { name: Some(attr.name.clone()), oid, value });
    }

    if buf.has_remaining() {
        return Err(DecodeError::out_of_range("record"));
    }

    Ok(Value::Record(Record { fields }))
}

pub(crate) fn pack(
    value: &Record,
    attributes: &[CompositeAttr],
    buf: &mut BytesMut,
) -> Result<(), EncodeError> {
    if value.fields.len() != attributes.len() {
        return Err(EncodeError::out_of_range("record"));
    }

    buf.put_u32(attributes.len() as u32);
    for (field, attr) in value.fields.iter().zip(attributes) {
        buf.put_u32(attr.oid);
        if field.value.is_null() {
            buf.put_i32(-1);
            continue;
        }
        let at = buf.len();
        buf.put_i32(0);
        attr.codec.encode(&field.value, buf)?;
        let len = (buf.len() - at - 4) as i32;
        buf[at..at + 4].copy_from_slice(&len.to_be_bytes());
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::oid;
    use crate::types::Codec;
    use std::sync::Arc;

    fn pair_codec() -> Codec {
        Codec::Record {
            attributes: Arc::from(vec![
                CompositeAttr { name: "id".into(), oid: oid::INT8, codec: Arc::new(Codec::Int8) },
                CompositeAttr { name: "label".into(), oid: oid::TEXT, codec: Arc::new(Codec::Text) },
            ]),
        }
    }

    #[test]
    fn composite_roundtrip() {
        let codec = pair_codec();
        let value = Value::Record(Record {
            fields: vec![
                RecordField { name: Some("id".into()), oid: oid::INT8, value: Value::Int8(7) },
                RecordField { name: Some("label".into()), oid: oid::TEXT, value: Value::Null },
            ],
        });

        let mut buf = BytesMut::new();
        codec.encode(&value, &mut buf).unwrap();
        let got = codec.decode(buf.freeze()).unwrap();
        assert_eq!(got, value);

        let Value::Record(record) = got else { panic!() };
        assert_eq!(record.get("id"), Some(&Value::Int8(7)));
        assert_eq!(record.get("label"), Some(&Value::Null));
    }

    #[test]
    fn attribute_count_must_match() {
        let codec = pair_codec();
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u32(oid::INT8);
        buf.put_i32(-1);
        assert!(codec.decode(buf.freeze()).is_err());
    }
}
