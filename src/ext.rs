//! Extension traits for buffer and string operation.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::ByteStr;
use crate::postgres::ProtocolError;

/// Extension for reading postgres wire primitives from [`Bytes`].
pub trait BytesExt {
    /// Split off a nul terminated string, not including the nul byte.
    fn get_nul_bytestr(&mut self) -> Result<ByteStr, ProtocolError>;

    /// Split off a nul terminated string into owned [`String`].
    fn get_nul_string(&mut self) -> Result<String, ProtocolError>;
}

impl BytesExt for Bytes {
    fn get_nul_bytestr(&mut self) -> Result<ByteStr, ProtocolError> {
        let Some(nul) = self.iter().position(|b| *b == 0) else {
            return Err(ProtocolError::missing_nul());
        };
        let str = ByteStr::from_utf8(self.split_to(nul)).map_err(ProtocolError::non_utf8)?;
        self.advance(1);
        Ok(str)
    }

    fn get_nul_string(&mut self) -> Result<String, ProtocolError> {
        self.get_nul_bytestr().map(|s| s.as_str().to_owned())
    }
}

/// Extension for writing postgres wire primitives.
pub trait BufMutExt {
    /// Write string content followed by a nul byte.
    fn put_nul_string(&mut self, string: &str);
}

impl BufMutExt for BytesMut {
    fn put_nul_string(&mut self, string: &str) {
        self.put_slice(string.as_bytes());
        self.put_u8(0);
    }
}

impl BufMutExt for &mut [u8] {
    fn put_nul_string(&mut self, string: &str) {
        self.put_slice(string.as_bytes());
        self.put_u8(0);
    }
}

/// Extension for sizing strings as postgres wire primitives.
pub trait StrExt {
    /// Length of self serialized as a nul terminated string.
    fn nul_string_len(&self) -> i32;
}

impl StrExt for str {
    fn nul_string_len(&self) -> i32 {
        self.len() as i32 + 1
    }
}

/// Lossless-or-panic integer narrowing for message sizing.
pub trait UsizeExt {
    fn to_i32(self) -> i32;
    fn to_u16(self) -> u16;
    fn to_u32(self) -> u32;
}

impl UsizeExt for usize {
    fn to_i32(self) -> i32 {
        self.try_into().expect("message size exceeds i32")
    }

    fn to_u16(self) -> u16 {
        self.try_into().expect("count exceeds u16")
    }

    fn to_u32(self) -> u32 {
        self.try_into().expect("count exceeds u32")
    }
}
