//! Supporting utility type.
mod bytestr;
pub use bytestr::ByteStr;
