//! `inet` and `cidr` wire format.
//!
//! Layout from the server's inet.h: address family, prefix bits, a cidr
//! flag, address byte count, address bytes.
use std::net::IpAddr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::value::{Inet, Value};

use super::{DecodeError, need};

/// The server uses AF_INET and AF_INET + 1, not the IP version numbers.
const PGSQL_AF_INET: u8 = 2;
const PGSQL_AF_INET6: u8 = 3;

pub(crate) fn unpack(mut buf: Bytes) -> Result<Value, DecodeError> {
    need(&buf, 4, "inet")?;
    let family = buf.get_u8();
    let prefix = buf.get_u8();
    let is_cidr = buf.get_u8() != 0;
    let size = buf.get_u8() as usize;
    need(&buf, size, "inet")?;

    let addr = match (family, size) {
        (PGSQL_AF_INET, 4) => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::from(octets)
        }
        (PGSQL_AF_INET6, 16) => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::from(octets)
        }
        _ => return Err(DecodeError::out_of_range("inet")),
    };

    let max_prefix = match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    };
    if prefix > max_prefix {
        return Err(DecodeError::out_of_range("inet"));
    }

    Ok(Value::Inet(Inet { addr, prefix, is_cidr }))
}

pub(crate) fn pack(value: &Inet, buf: &mut BytesMut) {
    match value.addr {
        IpAddr::V4(addr) => {
            buf.put_u8(PGSQL_AF_INET);
            buf.put_u8(value.prefix);
            buf.put_u8(value.is_cidr as u8);
            buf.put_u8(4);
            buf.put_slice(&addr.octets());
        }
        IpAddr::V6(addr) => {
            buf.put_u8(PGSQL_AF_INET6);
            buf.put_u8(value.prefix);
            buf.put_u8(value.is_cidr as u8);
            buf.put_u8(16);
            buf.put_slice(&addr.octets());
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::Codec;

    #[test]
    fn v4_and_v6_roundtrip() {
        for (addr, prefix) in [
            ("192.168.0.1".parse::<IpAddr>().unwrap(), 32),
            ("10.0.0.0".parse().unwrap(), 8),
            ("::1".parse().unwrap(), 128),
            ("fe80::".parse().unwrap(), 10),
        ] {
            let value = Value::Inet(Inet { addr, prefix, is_cidr: false });
            let mut buf = BytesMut::new();
            Codec::Inet.encode(&value, &mut buf).unwrap();
            assert_eq!(Codec::Inet.decode(buf.freeze()).unwrap(), value);
        }
    }

    #[test]
    fn prefix_over_width_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&[PGSQL_AF_INET, 33, 0, 4, 127, 0, 0, 1]);
        assert!(unpack(buf.freeze()).is_err());
    }
}
