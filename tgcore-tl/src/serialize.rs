//! The [`Serializable`] trait and its primitive implementations.
//!
//! Encoding follows the [MTProto binary serialization] rules. Every
//! implementation reports its exact encoded size so that [`to_bytes`]
//! allocates once.
//!
//! [MTProto binary serialization]: https://core.telegram.org/mtproto/serialize
//! [`to_bytes`]: Serializable::to_bytes

/// Serialize `self` into TL binary format.
pub trait Serializable {
    /// Appends the serialized form of `self` to `buf`.
    fn serialize(&self, buf: &mut impl Extend<u8>);

    /// Exact number of bytes [`serialize`](Self::serialize) will append.
    fn serialized_len(&self) -> usize;

    fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(self.serialized_len());
        self.serialize(&mut v);
        v
    }
}

/// Encoded size of a TL `bytes`/`string` holding `len` bytes.
pub fn bytes_len(len: usize) -> usize {
    let header = if len <= 253 { 1 } else { 4 };
    (header + len).div_ceil(4) * 4
}

impl Serializable for bool {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        let id = if *self { crate::BOOL_TRUE } else { crate::BOOL_FALSE };
        id.serialize(buf);
    }

    fn serialized_len(&self) -> usize {
        4
    }
}

macro_rules! le_primitive {
    ($($ty:ty),*) => {$(
        impl Serializable for $ty {
            fn serialize(&self, buf: &mut impl Extend<u8>) {
                buf.extend(self.to_le_bytes());
            }

            fn serialized_len(&self) -> usize {
                std::mem::size_of::<$ty>()
            }
        }
    )*};
}

le_primitive!(i32, u32, i64, f64);

impl<const N: usize> Serializable for [u8; N] {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.iter().copied());
    }

    fn serialized_len(&self) -> usize {
        N
    }
}

/// `[len][data][padding]` for up to 253 bytes, `[0xfe][len:3][data][padding]`
/// above that; the total is a multiple of 4.
impl Serializable for [u8] {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        let len = self.len();
        let header = if len <= 253 {
            buf.extend([len as u8]);
            1
        } else {
            buf.extend([0xfe, len as u8, (len >> 8) as u8, (len >> 16) as u8]);
            4
        };
        buf.extend(self.iter().copied());
        buf.extend(std::iter::repeat_n(0u8, bytes_len(len) - header - len));
    }

    fn serialized_len(&self) -> usize {
        bytes_len(self.len())
    }
}

impl Serializable for Vec<u8> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.as_slice().serialize(buf);
    }

    fn serialized_len(&self) -> usize {
        bytes_len(self.len())
    }
}

impl Serializable for str {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.as_bytes().serialize(buf);
    }

    fn serialized_len(&self) -> usize {
        bytes_len(self.len())
    }
}

impl Serializable for String {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.as_bytes().serialize(buf);
    }

    fn serialized_len(&self) -> usize {
        bytes_len(self.len())
    }
}

/// Boxed `Vector<long>`, the only vector the envelope layer writes by hand.
impl Serializable for [i64] {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        crate::VECTOR_ID.serialize(buf);
        (self.len() as i32).serialize(buf);
        for item in self {
            item.serialize(buf);
        }
    }

    fn serialized_len(&self) -> usize {
        8 + 8 * self.len()
    }
}

impl<T: Serializable + ?Sized> Serializable for &T {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        (**self).serialize(buf);
    }

    fn serialized_len(&self) -> usize {
        (**self).serialized_len()
    }
}
