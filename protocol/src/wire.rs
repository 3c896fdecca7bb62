//! Fixed-layout big-endian record (de)serialisation.
//!
//! Every message body and stream sub-header on the wire is a packed
//! sequence of big-endian fields with no implicit padding. Records are
//! declared with [`wire_record!`], which derives byte-exact `encode`/`decode`
//! from the field order.

use byteorder::{BigEndian, ByteOrder};

use crate::error::Error;
use crate::ObjectId;

/// A single fixed-size field of a wire record.
pub trait WireField: Sized {
    const WIRE_SIZE: usize;
    fn put(&self, out: &mut Vec<u8>);
    fn take(buf: &mut &[u8]) -> Result<Self, Error>;
}

fn take_bytes<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], Error> {
    if buf.len() < n {
        return Err(Error::EndOfStream);
    }
    let (head, rest) = buf.split_at(n);
    *buf = rest;
    Ok(head)
}

macro_rules! int_field {
    ($ty:ty, $size:literal, $read:ident, $write:ident) => {
        impl WireField for $ty {
            const WIRE_SIZE: usize = $size;

            fn put(&self, out: &mut Vec<u8>) {
                let mut raw = [0u8; $size];
                BigEndian::$write(&mut raw, *self);
                out.extend_from_slice(&raw);
            }

            fn take(buf: &mut &[u8]) -> Result<Self, Error> {
                take_bytes(buf, $size).map(BigEndian::$read)
            }
        }
    };
}

int_field!(u16, 2, read_u16, write_u16);
int_field!(i16, 2, read_i16, write_i16);
int_field!(u32, 4, read_u32, write_u32);
int_field!(i32, 4, read_i32, write_i32);
int_field!(u64, 8, read_u64, write_u64);
int_field!(i64, 8, read_i64, write_i64);

impl WireField for u8 {
    const WIRE_SIZE: usize = 1;

    fn put(&self, out: &mut Vec<u8>) {
        out.push(*self);
    }

    fn take(buf: &mut &[u8]) -> Result<Self, Error> {
        take_bytes(buf, 1).map(|raw| raw[0])
    }
}

impl WireField for bool {
    const WIRE_SIZE: usize = 1;

    fn put(&self, out: &mut Vec<u8>) {
        out.push(u8::from(*self));
    }

    fn take(buf: &mut &[u8]) -> Result<Self, Error> {
        take_bytes(buf, 1).map(|raw| raw[0] != 0)
    }
}

impl<const N: usize> WireField for [u8; N] {
    const WIRE_SIZE: usize = N;

    fn put(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self);
    }

    fn take(buf: &mut &[u8]) -> Result<Self, Error> {
        let raw = take_bytes(buf, N)?;
        let mut value = [0u8; N];
        value.copy_from_slice(raw);
        Ok(value)
    }
}

impl WireField for ObjectId {
    const WIRE_SIZE: usize = 8;

    fn put(&self, out: &mut Vec<u8>) {
        self.0.put(out);
    }

    fn take(buf: &mut &[u8]) -> Result<Self, Error> {
        i64::take(buf).map(ObjectId)
    }
}

/// A packed record with a fixed wire size.
pub trait WireRecord: Sized {
    const WIRE_SIZE: usize;

    fn encode_into(&self, out: &mut Vec<u8>);
    fn decode_from(buf: &mut &[u8]) -> Result<Self, Error>;

    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_SIZE);
        self.encode_into(&mut out);
        out
    }

    /// Decodes from the head of `buf`; trailing bytes are the caller's
    /// concern (frames may legitimately carry more than the record).
    fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        Self::decode_from(&mut buf)
    }
}

macro_rules! wire_record {
    (
        $(#[$meta:meta])*
        pub struct $name:ident {
            $( $(#[$fmeta:meta])* pub $field:ident : $ty:ty, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name {
            $( $(#[$fmeta])* pub $field : $ty, )*
        }

        impl $crate::wire::WireRecord for $name {
            const WIRE_SIZE: usize =
                0 $(+ <$ty as $crate::wire::WireField>::WIRE_SIZE)*;

            fn encode_into(&self, out: &mut Vec<u8>) {
                $( $crate::wire::WireField::put(&self.$field, out); )*
            }

            fn decode_from(buf: &mut &[u8]) -> Result<Self, $crate::Error> {
                Ok(Self {
                    $( $field: $crate::wire::WireField::take(buf)?, )*
                })
            }
        }
    };
}

pub(crate) use wire_record;

wire_record! {
    /// Frame header preceding every command, reply, and stream.
    ///
    /// `size` counts the header itself plus body and trailer, except for
    /// stream frames where it is the stream body length alone.
    pub struct Header {
        pub size: u32,
        pub command: u32,
    }
}
