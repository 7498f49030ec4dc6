//! Temporal wire formats, integer datetimes only.
//!
//! Timestamps count microseconds from 2000-01-01 00:00:00; dates count days
//! from the same epoch. The floating point representation predates server
//! 8.4 and is refused at startup, see the connection handshake.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use time::{Date, Duration, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::value::{Interval, Value};

use super::{DecodeError, EncodeError, exact};

/// 2000-01-01 as a julian day number.
const EPOCH_JDAY: i32 = 2_451_545;

fn epoch() -> PrimitiveDateTime {
    PrimitiveDateTime::new(
        Date::from_julian_day(EPOCH_JDAY).expect("epoch is representable"),
        Time::MIDNIGHT,
    )
}

pub(crate) fn unpack_timestamp(mut buf: Bytes) -> Result<Value, DecodeError> {
    exact(&buf, 8, "timestamp")?;
    let micros = buf.get_i64();
    epoch()
        .checked_add(Duration::microseconds(micros))
        .map(Value::Timestamp)
        .ok_or(DecodeError::out_of_range("timestamp"))
}

pub(crate) fn pack_timestamp(value: PrimitiveDateTime, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let delta = value - epoch();
    let micros = delta
        .whole_microseconds()
        .try_into()
        .map_err(|_| EncodeError::out_of_range("timestamp"))?;
    buf.put_i64(micros);
    Ok(())
}

pub(crate) fn unpack_timestamptz(mut buf: Bytes) -> Result<Value, DecodeError> {
    exact(&buf, 8, "timestamptz")?;
    let micros = buf.get_i64();
    epoch()
        .assume_utc()
        .checked_add(Duration::microseconds(micros))
        .map(Value::TimestampTz)
        .ok_or(DecodeError::out_of_range("timestamptz"))
}

pub(crate) fn pack_timestamptz(value: OffsetDateTime, buf: &mut BytesMut) -> Result<(), EncodeError> {
    let delta = value - epoch().assume_utc();
    let micros = delta
        .whole_microseconds()
        .try_into()
        .map_err(|_| EncodeError::out_of_range("timestamptz"))?;
    buf.put_i64(micros);
    Ok(())
}

pub(crate) fn unpack_date(mut buf: Bytes) -> Result<Value, DecodeError> {
    exact(&buf, 4, "date")?;
    let days = buf.get_i32();
    EPOCH_JDAY
        .checked_add(days)
        .and_then(|jday| Date::from_julian_day(jday).ok())
        .map(Value::Date)
        .ok_or(DecodeError::out_of_range("date"))
}

pub(crate) fn pack_date(value: Date, buf: &mut BytesMut) {
    buf.put_i32(value.to_julian_day() - EPOCH_JDAY);
}

fn micros_of_day(time: Time) -> i64 {
    let (h, m, s, micro) = time.as_hms_micro();
    ((h as i64 * 60 + m as i64) * 60 + s as i64) * 1_000_000 + micro as i64
}

fn time_from_micros(micros: i64, ty: &'static str) -> Result<Time, DecodeError> {
    if !(0..86_400_000_000).contains(&micros) {
        return Err(DecodeError::out_of_range(ty));
    }
    let (micro, rest) = ((micros % 1_000_000) as u32, micros / 1_000_000);
    let (s, rest) = ((rest % 60) as u8, rest / 60);
    let (m, h) = ((rest % 60) as u8, (rest / 60) as u8);
    Time::from_hms_micro(h, m, s, micro).map_err(|_| DecodeError::out_of_range(ty))
}

pub(crate) fn unpack_time(mut buf: Bytes) -> Result<Value, DecodeError> {
    exact(&buf, 8, "time")?;
    time_from_micros(buf.get_i64(), "time").map(Value::Time)
}

pub(crate) fn pack_time(value: Time, buf: &mut BytesMut) {
    buf.put_i64(micros_of_day(value));
}

pub(crate) fn unpack_timetz(mut buf: Bytes) -> Result<Value, DecodeError> {
    exact(&buf, 12, "timetz")?;
    let time = time_from_micros(buf.get_i64(), "timetz")?;
    // the zone word counts seconds *west* of UTC
    let zone = buf.get_i32();
    let offset = UtcOffset::from_whole_seconds(-zone).map_err(|_| DecodeError::out_of_range("timetz"))?;
    Ok(Value::TimeTz(time, offset))
}

pub(crate) fn pack_timetz(value: Time, offset: UtcOffset, buf: &mut BytesMut) {
    buf.put_i64(micros_of_day(value));
    buf.put_i32(-offset.whole_seconds());
}

pub(crate) fn unpack_interval(mut buf: Bytes) -> Result<Value, DecodeError> {
    exact(&buf, 16, "interval")?;
    Ok(Value::Interval(Interval {
        micros: buf.get_i64(),
        days: buf.get_i32(),
        months: buf.get_i32(),
    }))
}

pub(crate) fn pack_interval(value: Interval, buf: &mut BytesMut) {
    buf.put_i64(value.micros);
    buf.put_i32(value.days);
    buf.put_i32(value.months);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::Codec;
    use time::macros::{date, datetime, time};

    fn roundtrip(codec: &Codec, value: Value) -> Value {
        let mut buf = BytesMut::new();
        codec.encode(&value, &mut buf).unwrap();
        codec.decode(buf.freeze()).unwrap()
    }

    #[test]
    fn timestamp_epoch_is_zero() {
        let mut buf = BytesMut::new();
        pack_timestamp(datetime!(2000-01-01 0:00), &mut buf).unwrap();
        assert_eq!(&buf[..], 0i64.to_be_bytes());
    }

    #[test]
    fn timestamp_roundtrip() {
        let value = Value::Timestamp(datetime!(1969-07-20 20:17:40.123456));
        assert_eq!(roundtrip(&Codec::Timestamp, value.clone()), value);
    }

    #[test]
    fn timestamptz_roundtrip_normalizes_to_utc() {
        let value = datetime!(2024-02-29 12:00 +3);
        let Value::TimestampTz(got) = roundtrip(&Codec::TimestampTz, Value::TimestampTz(value))
        else {
            panic!()
        };
        assert_eq!(got, value);
        assert_eq!(got.offset(), UtcOffset::UTC);
    }

    #[test]
    fn date_roundtrip() {
        for d in [date!(2000-01-01), date!(1999-12-31), date!(2038-01-19)] {
            assert_eq!(roundtrip(&Codec::Date, Value::Date(d)), Value::Date(d));
        }
    }

    #[test]
    fn time_of_day_bounds() {
        let value = Value::Time(time!(23:59:59.999999));
        assert_eq!(roundtrip(&Codec::Time, value.clone()), value);

        let mut buf = BytesMut::new();
        buf.put_i64(86_400_000_000);
        assert!(unpack_time(buf.freeze()).is_err());
    }

    #[test]
    fn timetz_zone_is_west_positive() {
        let value = Value::TimeTz(time!(10:30), UtcOffset::from_whole_seconds(7200).unwrap());
        let mut buf = BytesMut::new();
        Codec::TimeTz.encode(&value, &mut buf).unwrap();
        // +02:00 is stored as -7200 seconds west
        assert_eq!(&buf[8..12], (-7200i32).to_be_bytes());
        assert_eq!(Codec::TimeTz.decode(buf.freeze()).unwrap(), value);
    }

    #[test]
    fn interval_roundtrip() {
        let value = Value::Interval(Interval { months: -2, days: 14, micros: 3_600_000_001 });
        assert_eq!(roundtrip(&Codec::Interval, value.clone()), value);
    }
}
