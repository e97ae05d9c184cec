//! The [`Deserializable`] trait, the [`Cursor`] buffer, primitive impls and
//! the codec [`Error`].

use std::fmt;

/// Why a buffer could not be decoded. Decoding never yields partial values.
#[derive(Clone, Debug, PartialEq)]
pub enum Error {
    /// Ran out of bytes before the value was fully read.
    UnexpectedEof,
    /// No constructor with this id is known.
    UnknownConstructor { id: u32 },
    /// A known constructor appeared where another type was expected.
    UnexpectedConstructor { id: u32, expected: String },
    /// A `string` field held invalid UTF-8.
    InvalidUtf8,
    /// A length or element count is negative or exceeds the remaining bytes.
    InvalidLength,
    /// Bytes were left over after the top-level value.
    TrailingBytes { remaining: usize },
    /// A type or constructor name that the registry does not define.
    UnknownType { name: String },
    /// A required field was not set, or a named field does not exist.
    MissingField { ctor: String, field: String },
    /// A field holds a value of the wrong kind.
    TypeMismatch { field: String, expected: String },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of buffer"),
            Self::UnknownConstructor { id } => write!(f, "unknown constructor id: {id:#010x}"),
            Self::UnexpectedConstructor { id, expected } => {
                write!(f, "unexpected constructor {id:#010x}, expected {expected}")
            }
            Self::InvalidUtf8 => write!(f, "string is not valid UTF-8"),
            Self::InvalidLength => write!(f, "length exceeds the remaining buffer"),
            Self::TrailingBytes { remaining } => write!(f, "{remaining} trailing bytes after value"),
            Self::UnknownType { name } => write!(f, "unknown type or constructor: {name}"),
            Self::MissingField { ctor, field } => write!(f, "{ctor} has no value for field {field}"),
            Self::TypeMismatch { field, expected } => write!(f, "field {field} expects {expected}"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// A zero-copy cursor over an in-memory byte slice.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let b = *self.buf.get(self.pos).ok_or(Error::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<()> {
        out.copy_from_slice(self.read_slice(out.len())?);
        Ok(())
    }

    /// Borrow the next `len` bytes and advance past them.
    pub fn read_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(Error::UnexpectedEof);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    /// Borrow everything that is left and move to the end.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    /// Read the next little-endian `u32` without consuming it.
    pub fn peek_u32(&self) -> Result<u32> {
        let bytes = self.buf.get(self.pos..self.pos + 4).ok_or(Error::UnexpectedEof)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Read an element count and check that `count * min_item` bytes remain.
    pub fn read_count(&mut self, min_item: usize) -> Result<usize> {
        let count = i32::deserialize(self)?;
        let count = usize::try_from(count).map_err(|_| Error::InvalidLength)?;
        match count.checked_mul(min_item.max(1)) {
            Some(need) if need <= self.remaining() => Ok(count),
            _ => Err(Error::InvalidLength),
        }
    }
}

pub type Buffer<'a, 'b> = &'a mut Cursor<'b>;

/// Decode a value from TL binary format.
pub trait Deserializable: Sized {
    /// Read `Self` from `buf`, advancing its position.
    fn deserialize(buf: Buffer) -> Result<Self>;

    /// Decode from a slice that must contain exactly one value.
    fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::from_slice(bytes);
        let value = Self::deserialize(&mut cursor)?;
        match cursor.remaining() {
            0 => Ok(value),
            remaining => Err(Error::TrailingBytes { remaining }),
        }
    }
}

impl Deserializable for bool {
    fn deserialize(buf: Buffer) -> Result<Self> {
        match u32::deserialize(buf)? {
            crate::BOOL_TRUE => Ok(true),
            crate::BOOL_FALSE => Ok(false),
            id => Err(Error::UnexpectedConstructor { id, expected: "Bool".into() }),
        }
    }
}

macro_rules! le_primitive {
    ($($ty:ty),*) => {$(
        impl Deserializable for $ty {
            fn deserialize(buf: Buffer) -> Result<Self> {
                let mut b = [0u8; std::mem::size_of::<$ty>()];
                buf.read_exact(&mut b)?;
                Ok(<$ty>::from_le_bytes(b))
            }
        }
    )*};
}

le_primitive!(i32, u32, i64, f64);

impl<const N: usize> Deserializable for [u8; N] {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let mut b = [0u8; N];
        buf.read_exact(&mut b)?;
        Ok(b)
    }
}

/// TL `bytes`: the declared length is checked against the buffer before
/// anything is allocated.
impl Deserializable for Vec<u8> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let first = buf.read_byte()?;
        let (len, header) = if first < 0xfe {
            (first as usize, 1)
        } else if first == 0xfe {
            let a = buf.read_byte()? as usize;
            let b = buf.read_byte()? as usize;
            let c = buf.read_byte()? as usize;
            (a | (b << 8) | (c << 16), 4)
        } else {
            return Err(Error::InvalidLength);
        };

        let padding = (4 - (header + len) % 4) % 4;
        if len + padding > buf.remaining() {
            return Err(Error::InvalidLength);
        }
        let data = buf.read_slice(len)?.to_vec();
        buf.read_slice(padding)?;
        Ok(data)
    }
}

impl Deserializable for String {
    fn deserialize(buf: Buffer) -> Result<Self> {
        String::from_utf8(Vec::<u8>::deserialize(buf)?).map_err(|_| Error::InvalidUtf8)
    }
}

/// Boxed `Vector<T>`.
impl<T: Deserializable> Deserializable for Vec<T> {
    fn deserialize(buf: Buffer) -> Result<Self> {
        let id = u32::deserialize(buf)?;
        if id != crate::VECTOR_ID {
            return Err(Error::UnexpectedConstructor { id, expected: "Vector".into() });
        }
        let count = buf.read_count(4)?;
        (0..count).map(|_| T::deserialize(buf)).collect()
    }
}
