use crate::{MemError, MemResult};
use std::{
    fmt,
    mem,
    ops::{Deref, DerefMut},
};

/// Plain numeric values that can be copied to and from raw memory.
///
/// Every bit pattern of `Self` must be a valid value: reading a `Scalar` from untyped memory
/// never produces an invalid value. Values are encoded in native byte order.
pub trait Scalar: Copy + Sized {
    const SIZE: usize = mem::size_of::<Self>();

    /// Builds a value from exactly `Self::SIZE` bytes.
    fn from_ne_slice(bytes: &[u8]) -> Self;

    /// Stores the value into exactly `Self::SIZE` bytes.
    fn write_ne_slice(self, out: &mut [u8]);
}

macro_rules! impl_scalar {
    ($($ty:ty),*) => {
        $(
            impl Scalar for $ty {
                fn from_ne_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    <$ty>::from_ne_bytes(raw)
                }

                fn write_ne_slice(self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_ne_bytes());
                }
            }
        )*
    };
}

impl_scalar!(u8, i8, u16, i16, u32, i32, u64, i64, usize, isize, f32, f64);

/// Decodes a fixed-length string field: bytes up to the first NUL, invalid UTF-8 replaced.
pub(crate) fn decode_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

/// A fixed-size, mutable block of raw bytes copied out of (or destined for) a target process.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct MemoryBuffer {
    bytes: Box<[u8]>,
}

impl MemoryBuffer {
    /// Creates a zero-filled buffer of `size` bytes.
    pub fn new(size: usize) -> Self {
        MemoryBuffer {
            bytes: vec![0; size].into_boxed_slice(),
        }
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.bytes.into_vec()
    }

    fn check<T: Scalar>(&self, offset: usize) -> MemResult<()> {
        self.check_range(offset, T::SIZE)?;
        let align = mem::align_of::<T>();
        if offset % align != 0 {
            return Err(MemError::Misaligned { offset, align });
        }
        Ok(())
    }

    fn check_range(&self, offset: usize, len: usize) -> MemResult<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.bytes.len() => Ok(()),
            _ => Err(MemError::OutOfBounds {
                offset,
                len,
                size: self.bytes.len(),
            }),
        }
    }

    /// Reads a scalar stored at `offset`. The offset must be naturally aligned for `T`.
    pub fn get<T: Scalar>(&self, offset: usize) -> MemResult<T> {
        self.check::<T>(offset)?;
        Ok(T::from_ne_slice(&self.bytes[offset..offset + T::SIZE]))
    }

    /// Stores a scalar at `offset`. The offset must be naturally aligned for `T`.
    pub fn put<T: Scalar>(&mut self, offset: usize, value: T) -> MemResult<&mut Self> {
        self.check::<T>(offset)?;
        value.write_ne_slice(&mut self.bytes[offset..offset + T::SIZE]);
        Ok(self)
    }

    pub fn get_string(&self, offset: usize, len: usize) -> MemResult<String> {
        self.check_range(offset, len)?;
        Ok(decode_string(&self.bytes[offset..offset + len]))
    }

    /// Copies `data` into the buffer at `offset`.
    pub fn put_bytes(&mut self, offset: usize, data: &[u8]) -> MemResult<&mut Self> {
        self.check_range(offset, data.len())?;
        self.bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(self)
    }
}

impl From<Vec<u8>> for MemoryBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        MemoryBuffer {
            bytes: bytes.into_boxed_slice(),
        }
    }
}

impl From<&[u8]> for MemoryBuffer {
    fn from(bytes: &[u8]) -> Self {
        MemoryBuffer {
            bytes: bytes.into(),
        }
    }
}

impl Deref for MemoryBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl DerefMut for MemoryBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl AsRef<[u8]> for MemoryBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Debug for MemoryBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 16;
        write!(f, "MemoryBuffer({} bytes: ", self.bytes.len())?;
        for b in self.bytes.iter().take(PREVIEW) {
            write!(f, "{:02x}", b)?;
        }
        if self.bytes.len() > PREVIEW {
            write!(f, "..")?;
        }
        write!(f, ")")
    }
}

/// Typed reads & writes at absolute addresses.
///
/// Implementors provide the three primitives; every named accessor is derived from them.
pub trait ScalarAccess {
    fn read_bytes(&self, address: usize, len: usize) -> MemResult<MemoryBuffer>;

    fn read_scalar<T: Scalar>(&self, address: usize) -> MemResult<T>;

    fn write_scalar<T: Scalar>(&self, address: usize, value: T) -> MemResult<&Self>;

    /// Reads a boolean flag. Only stored values strictly greater than 1 are `true`.
    fn read_boolean(&self, address: usize) -> MemResult<bool> {
        Ok(self.read_scalar::<u8>(address)? > 1)
    }

    fn read_i8(&self, address: usize) -> MemResult<i8> {
        self.read_scalar(address)
    }

    fn read_u8(&self, address: usize) -> MemResult<u8> {
        self.read_scalar(address)
    }

    fn read_i16(&self, address: usize) -> MemResult<i16> {
        self.read_scalar(address)
    }

    fn read_u16(&self, address: usize) -> MemResult<u16> {
        self.read_scalar(address)
    }

    fn read_i32(&self, address: usize) -> MemResult<i32> {
        self.read_scalar(address)
    }

    fn read_u32(&self, address: usize) -> MemResult<u32> {
        self.read_scalar(address)
    }

    fn read_i64(&self, address: usize) -> MemResult<i64> {
        self.read_scalar(address)
    }

    fn read_u64(&self, address: usize) -> MemResult<u64> {
        self.read_scalar(address)
    }

    fn read_f32(&self, address: usize) -> MemResult<f32> {
        self.read_scalar(address)
    }

    fn read_f64(&self, address: usize) -> MemResult<f64> {
        self.read_scalar(address)
    }

    /// Reads a pointer-sized value.
    fn read_pointer(&self, address: usize) -> MemResult<usize> {
        self.read_scalar(address)
    }

    /// Reads a `len` byte string field, stopping at the first NUL.
    fn read_string(&self, address: usize, len: usize) -> MemResult<String> {
        Ok(decode_string(&self.read_bytes(address, len)?))
    }

    fn write_boolean(&self, address: usize, value: bool) -> MemResult<&Self> {
        self.write_scalar(address, value as u8)
    }

    fn write_i8(&self, address: usize, value: i8) -> MemResult<&Self> {
        self.write_scalar(address, value)
    }

    fn write_u8(&self, address: usize, value: u8) -> MemResult<&Self> {
        self.write_scalar(address, value)
    }

    fn write_i16(&self, address: usize, value: i16) -> MemResult<&Self> {
        self.write_scalar(address, value)
    }

    fn write_u16(&self, address: usize, value: u16) -> MemResult<&Self> {
        self.write_scalar(address, value)
    }

    fn write_i32(&self, address: usize, value: i32) -> MemResult<&Self> {
        self.write_scalar(address, value)
    }

    fn write_u32(&self, address: usize, value: u32) -> MemResult<&Self> {
        self.write_scalar(address, value)
    }

    fn write_i64(&self, address: usize, value: i64) -> MemResult<&Self> {
        self.write_scalar(address, value)
    }

    fn write_u64(&self, address: usize, value: u64) -> MemResult<&Self> {
        self.write_scalar(address, value)
    }

    fn write_f32(&self, address: usize, value: f32) -> MemResult<&Self> {
        self.write_scalar(address, value)
    }

    fn write_f64(&self, address: usize, value: f64) -> MemResult<&Self> {
        self.write_scalar(address, value)
    }

    fn write_pointer(&self, address: usize, value: usize) -> MemResult<&Self> {
        self.write_scalar(address, value)
    }
}

#[cfg(test)]
mod tests {
    use super::{decode_string, MemoryBuffer};
    use crate::MemError;

    #[test]
    fn typed_accessors() {
        let mut buf = MemoryBuffer::new(16);
        buf.put(0, 0x1122_3344u32)
            .unwrap()
            .put(4, -2i16)
            .unwrap()
            .put(8, 1.5f64)
            .unwrap();

        assert_eq!(buf.get::<u32>(0).unwrap(), 0x1122_3344);
        assert_eq!(buf.get::<i16>(4).unwrap(), -2);
        assert_eq!(buf.get::<f64>(8).unwrap(), 1.5);
        assert_eq!(&buf[0..4], &0x1122_3344u32.to_ne_bytes());
    }

    #[test]
    fn rejects_misaligned_and_out_of_bounds() {
        let mut buf = MemoryBuffer::new(8);

        match buf.get::<u32>(2) {
            Err(MemError::Misaligned { offset: 2, align: 4 }) => {}
            other => panic!("unexpected {:?}", other),
        }
        match buf.put(8, 1u8) {
            Err(MemError::OutOfBounds { offset: 8, len: 1, size: 8 }) => {}
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
        assert!(buf.get::<u64>(usize::MAX).is_err());
    }

    #[test]
    fn strings_stop_at_nul() {
        assert_eq!(decode_string(b"hello\0world"), "hello");
        assert_eq!(decode_string(b"abc"), "abc");

        let mut buf = MemoryBuffer::new(8);
        buf.put_bytes(1, b"crab").unwrap();
        assert_eq!(buf.get_string(1, 7).unwrap(), "crab");
        assert!(buf.get_string(4, 5).is_err());
    }
}
