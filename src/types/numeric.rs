//! `numeric` wire format.
//!
//! Header of four 16 bit words: digit count, weight, sign, display scale,
//! followed by the base-10000 digits. Non-finite values are carried in the
//! sign word with no digits.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::value::{Numeric, NumericSign, Value};

use super::{DecodeError, need};

const SIGN_POSITIVE: u16 = 0x0000;
const SIGN_NEGATIVE: u16 = 0x4000;
const SIGN_NAN: u16 = 0xC000;
const SIGN_PINF: u16 = 0xD000;
const SIGN_NINF: u16 = 0xF000;

pub(crate) fn unpack(mut buf: Bytes) -> Result<Value, DecodeError> {
    need(&buf, 8, "numeric")?;
    let ndigits = buf.get_u16();
    let weight = buf.get_i16();
    let sign = buf.get_u16();
    let dscale = buf.get_u16();

    let sign = match sign {
        SIGN_POSITIVE => NumericSign::Positive,
        SIGN_NEGATIVE => NumericSign::Negative,
        SIGN_NAN => return Ok(Value::Numeric(Numeric::NAN)),
        SIGN_PINF => {
            return Ok(Value::Numeric(Numeric {
                sign: NumericSign::PositiveInfinity,
                ..Numeric::NAN
            }));
        }
        SIGN_NINF => {
            return Ok(Value::Numeric(Numeric {
                sign: NumericSign::NegativeInfinity,
                ..Numeric::NAN
            }));
        }
        _ => return Err(DecodeError::out_of_range("numeric")),
    };

    need(&buf, 2 * ndigits as usize, "numeric")?;
    let mut digits = Vec::with_capacity(ndigits as usize);
    for _ in 0..ndigits {
        let digit = buf.get_i16();
        if !(0..10000).contains(&digit) {
            return Err(DecodeError::out_of_range("numeric"));
        }
        digits.push(digit);
    }

    Ok(Value::Numeric(Numeric { sign, weight, dscale, digits }))
}

pub(crate) fn pack(value: &Numeric, buf: &mut BytesMut) {
    let (sign, digits): (u16, &[i16]) = match value.sign {
        NumericSign::Positive => (SIGN_POSITIVE, &value.digits),
        NumericSign::Negative => (SIGN_NEGATIVE, &value.digits),
        NumericSign::NaN => (SIGN_NAN, &[]),
        NumericSign::PositiveInfinity => (SIGN_PINF, &[]),
        NumericSign::NegativeInfinity => (SIGN_NINF, &[]),
    };

    buf.put_u16(digits.len() as u16);
    buf.put_i16(value.weight);
    buf.put_u16(sign);
    buf.put_u16(value.dscale);
    for digit in digits {
        buf.put_i16(*digit);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::Codec;

    fn roundtrip(value: Numeric) -> Numeric {
        let mut buf = BytesMut::new();
        Codec::Numeric.encode(&Value::Numeric(value), &mut buf).unwrap();
        match Codec::Numeric.decode(buf.freeze()).unwrap() {
            Value::Numeric(v) => v,
            other => panic!("expected numeric, got {other:?}"),
        }
    }

    #[test]
    fn finite_roundtrip() {
        // 12345.678 = digits [1, 2345, 6780] at weight 1, dscale 3
        let value = Numeric {
            sign: NumericSign::Positive,
            weight: 1,
            dscale: 3,
            digits: vec![1, 2345, 6780],
        };
        assert_eq!(roundtrip(value.clone()), value);

        let negative = Numeric { sign: NumericSign::Negative, ..value };
        assert_eq!(roundtrip(negative.clone()), negative);
    }

    #[test]
    fn sentinel_roundtrip() {
        for sign in [
            NumericSign::NaN,
            NumericSign::PositiveInfinity,
            NumericSign::NegativeInfinity,
        ] {
            let value = Numeric { sign, ..Numeric::NAN };
            assert_eq!(roundtrip(value).sign, sign);
        }
    }

    #[test]
    fn from_integer() {
        let value = Numeric::from(-50_0005_i64);
        assert_eq!(value.sign, NumericSign::Negative);
        assert_eq!(value.digits, vec![50, 5]);
        assert_eq!(value.weight, 1);
    }

    #[test]
    fn digit_out_of_base_range() {
        let mut buf = BytesMut::new();
        buf.put_u16(1);
        buf.put_i16(0);
        buf.put_u16(SIGN_POSITIVE);
        buf.put_u16(0);
        buf.put_i16(10_000);
        assert!(unpack(buf.freeze()).is_err());
    }
}
