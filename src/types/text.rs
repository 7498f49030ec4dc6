//! Text format rendering for the fallback codec.
//!
//! Used when either side lacks a binary codec for a type: the parameter is
//! sent in text format, in the representation the type input function
//! accepts.
use std::fmt::Write;

use time::macros::format_description;

use crate::value::{Numeric, NumericSign, Value};

use super::EncodeError;

pub(crate) fn render(value: &Value) -> Result<String, EncodeError> {
    let mut out = String::new();
    match value {
        Value::Bool(v) => out.push(if *v { 't' } else { 'f' }),
        Value::Int2(v) => out.push_str(itoa::Buffer::new().format(*v)),
        Value::Int4(v) => out.push_str(itoa::Buffer::new().format(*v)),
        Value::Int8(v) => out.push_str(itoa::Buffer::new().format(*v)),
        Value::Oid(v) => out.push_str(itoa::Buffer::new().format(*v)),
        Value::Float4(v) => render_float(&mut out, f64::from(*v)),
        Value::Float8(v) => render_float(&mut out, *v),
        Value::Text(v) => out.push_str(v),
        Value::Bytea(v) => {
            out.push_str("\\x");
            for byte in v.iter() {
                write!(out, "{byte:02x}").expect("write to string");
            }
        }
        Value::Numeric(v) => render_numeric(&mut out, v),
        Value::Date(v) => {
            let fmt = format_description!("[year]-[month]-[day]");
            out.push_str(&v.format(fmt).expect("date is formattable"));
        }
        Value::Time(v) => {
            let fmt = format_description!("[hour]:[minute]:[second].[subsecond digits:6]");
            out.push_str(&v.format(fmt).expect("time is formattable"));
        }
        Value::Timestamp(v) => {
            let fmt = format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"
            );
            out.push_str(&v.format(fmt).expect("timestamp is formattable"));
        }
        Value::TimestampTz(v) => {
            let fmt = format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6][offset_hour sign:mandatory]:[offset_minute]"
            );
            out.push_str(&v.format(fmt).expect("timestamptz is formattable"));
        }
        Value::TimeTz(v, offset) => {
            let fmt = format_description!("[hour]:[minute]:[second].[subsecond digits:6]");
            out.push_str(&v.format(fmt).expect("time is formattable"));
            let seconds = offset.whole_seconds();
            write!(
                out,
                "{}{:02}:{:02}",
                if seconds < 0 { '-' } else { '+' },
                seconds.abs() / 3600,
                seconds.abs() % 3600 / 60,
            )
            .expect("write to string");
        }
        Value::Interval(v) => {
            let secs = v.micros / 1_000_000;
            let micros = (v.micros % 1_000_000).unsigned_abs();
            write!(
                out,
                "{} mons {} days {}.{:06} seconds",
                v.months, v.days, secs, micros
            )
            .expect("write to string");
        }
        Value::Inet(v) => {
            write!(out, "{}/{}", v.addr, v.prefix).expect("write to string");
        }
        Value::Null | Value::Array(_) | Value::Record(_) => {
            return Err(EncodeError::type_mismatch("text", value.kind()));
        }
    }
    Ok(out)
}

fn render_float(out: &mut String, value: f64) {
    if value.is_nan() {
        out.push_str("NaN");
    } else if value == f64::INFINITY {
        out.push_str("Infinity");
    } else if value == f64::NEG_INFINITY {
        out.push_str("-Infinity");
    } else {
        write!(out, "{value}").expect("write to string");
    }
}

fn render_numeric(out: &mut String, value: &Numeric) {
    match value.sign {
        NumericSign::NaN => return out.push_str("NaN"),
        NumericSign::PositiveInfinity => return out.push_str("Infinity"),
        NumericSign::NegativeInfinity => return out.push_str("-Infinity"),
        NumericSign::Negative => out.push('-'),
        NumericSign::Positive => {}
    }

    let digit = |i: i32| -> i16 {
        match usize::try_from(i) {
            Ok(i) => value.digits.get(i).copied().unwrap_or(0),
            Err(_) => 0,
        }
    };

    // integer part: base-10000 digits 0..=weight
    if value.weight < 0 {
        out.push('0');
    } else {
        write!(out, "{}", digit(0)).expect("write to string");
        for i in 1..=i32::from(value.weight) {
            write!(out, "{:04}", digit(i)).expect("write to string");
        }
    }

    // fraction part, exactly dscale decimal digits
    if value.dscale > 0 {
        let mut fraction = String::new();
        let mut i = i32::from(value.weight) + 1;
        while fraction.len() < value.dscale as usize {
            write!(fraction, "{:04}", digit(i)).expect("write to string");
            i += 1;
        }
        fraction.truncate(value.dscale as usize);
        out.push('.');
        out.push_str(&fraction);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn scalar_rendering() {
        assert_eq!(render(&Value::Bool(true)).unwrap(), "t");
        assert_eq!(render(&Value::Int4(-42)).unwrap(), "-42");
        assert_eq!(render(&Value::Float8(f64::NAN)).unwrap(), "NaN");
        assert_eq!(render(&Value::Bytea(vec![0xde, 0xad].into())).unwrap(), "\\xdead");
        assert_eq!(
            render(&Value::Timestamp(datetime!(2024-01-02 03:04:05))).unwrap(),
            "2024-01-02 03:04:05.000000",
        );
    }

    #[test]
    fn numeric_rendering() {
        let n = Numeric {
            sign: NumericSign::Negative,
            weight: 1,
            dscale: 3,
            digits: vec![1, 2345, 6780],
        };
        assert_eq!(render(&Value::Numeric(n)).unwrap(), "-12345.678");

        let small = Numeric {
            sign: NumericSign::Positive,
            weight: -1,
            dscale: 4,
            digits: vec![500],
        };
        assert_eq!(render(&Value::Numeric(small)).unwrap(), "0.0500");

        assert_eq!(render(&Value::Numeric(Numeric::from(0_i64))).unwrap(), "0");
    }
}
