//! Deterministic, hand-written binary encoding for hashed and persisted bytes.
//!
//! The journal hashes the serialized form of every key (DJB2 over the wire
//! bytes selects the hash subtable and slot), and the manifest snapshot is
//! checksummed on disk. Both require a wire format that **never** shifts under
//! a dependency upgrade, so this module owns it outright instead of leaning on
//! an external serializer.
//!
//! # Wire format
//!
//! | Rust type     | Encoding                                     |
//! |---------------|----------------------------------------------|
//! | `u8`          | 1 byte                                       |
//! | `u32`         | 4 bytes, little-endian                       |
//! | `u64`         | 8 bytes, little-endian                       |
//! | `bool`        | 1 byte (`0x00` = false, `0x01` = true)       |
//! | `[u8; 4]`     | 4 raw bytes (no length prefix)               |
//! | `Vec<u8>`     | `[u32 len][bytes]`                           |
//! | `String`      | `[u32 len][utf-8 bytes]`                     |
//! | `Option<T>`   | `[u8 tag: 0=None, 1=Some][T if Some]`        |
//! | `Vec<T>`      | `[u32 count][T₁][T₂]…` (via [`encode_vec`])  |
//! | `enum`        | `[u8 variant][fields…]` (hand-written)       |
//!
//! All multi-byte integers are little-endian. Lengths and counts are `u32`.
//!
//! # Safety limits
//!
//! Variable-length decoders enforce upper bounds so that corrupted or crafted
//! input cannot trigger allocation bombs: [`MAX_BYTE_LEN`] for byte strings
//! and [`MAX_VEC_ELEMENTS`] for element counts.
//!
//! No function in this module panics; all failures surface as
//! [`EncodingError`].


use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Safety limits
// ------------------------------------------------------------------------------------------------

/// Maximum byte length accepted for a single `Vec<u8>` or `String` while
/// decoding (64 MiB). Journal values are bounded well below this.
pub const MAX_BYTE_LEN: u32 = 64 * 1024 * 1024;

/// Maximum element count accepted for a `Vec<T>` while decoding (4 M).
pub const MAX_VEC_ELEMENTS: u32 = 4 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// An enum discriminant was not recognised.
    #[error("invalid tag {tag:#04x} for {type_name}")]
    InvalidTag {
        /// The discriminant byte that was read.
        tag: u8,
        /// The Rust type being decoded.
        type_name: &'static str,
    },

    /// A bool field contained a byte other than `0x00` or `0x01`.
    #[error("invalid bool byte: {0:#04x}")]
    InvalidBool(u8),

    /// A byte sequence decoded as a string was not valid UTF-8.
    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A length or count exceeded its safety limit.
    #[error("length {len} exceeds limit {limit} for {type_name}")]
    LengthOverflow {
        /// The decoded length or count.
        len: u64,
        /// The limit that was exceeded.
        limit: u64,
        /// The Rust type being decoded.
        type_name: &'static str,
    },
}

// ------------------------------------------------------------------------------------------------
// Core traits
// ------------------------------------------------------------------------------------------------

/// Serialize `self` into a byte buffer.
///
/// Implementations must produce deterministic output: the same logical value
/// always yields the exact same byte sequence.
pub trait Encode {
    /// Append the encoded representation of `self` to `buf`.
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError>;
}

/// Deserialize a value from a byte slice.
///
/// Returns `(value, bytes_consumed)` so that callers can advance a cursor
/// through a buffer containing multiple encoded items.
pub trait Decode: Sized {
    /// Decode one value starting at `buf[0]`.
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError>;
}

// ------------------------------------------------------------------------------------------------
// Convenience functions
// ------------------------------------------------------------------------------------------------

/// Encode a value into a freshly-allocated `Vec<u8>`.
pub fn encode_to_vec<T: Encode>(value: &T) -> Result<Vec<u8>, EncodingError> {
    let mut buf = Vec::new();
    value.encode_to(&mut buf)?;
    Ok(buf)
}

/// Decode a value from the beginning of `buf`, returning `(value, consumed)`.
pub fn decode_from_slice<T: Decode>(buf: &[u8]) -> Result<(T, usize), EncodingError> {
    T::decode_from(buf)
}

/// Encode a vector as `[u32 count][elements…]`.
pub fn encode_vec<T: Encode>(items: &[T], buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    let count = len_to_u32(items.len(), "Vec<T>")?;
    count.encode_to(buf)?;
    for item in items {
        item.encode_to(buf)?;
    }
    Ok(())
}

/// Decode a vector written by [`encode_vec`], returning `(vec, consumed)`.
pub fn decode_vec<T: Decode>(buf: &[u8]) -> Result<(Vec<T>, usize), EncodingError> {
    let (count, mut offset) = u32::decode_from(buf)?;
    if count > MAX_VEC_ELEMENTS {
        return Err(EncodingError::LengthOverflow {
            len: count as u64,
            limit: MAX_VEC_ELEMENTS as u64,
            type_name: "Vec<T>",
        });
    }
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (item, n) = T::decode_from(&buf[offset..])?;
        offset += n;
        items.push(item);
    }
    Ok((items, offset))
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

/// Verify that `buf` holds at least `needed` bytes.
#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

/// Convert a `usize` length to `u32`, rejecting values over `u32::MAX`.
#[inline]
fn len_to_u32(len: usize, type_name: &'static str) -> Result<u32, EncodingError> {
    u32::try_from(len).map_err(|_| EncodingError::LengthOverflow {
        len: len as u64,
        limit: u32::MAX as u64,
        type_name,
    })
}

// ------------------------------------------------------------------------------------------------
// Primitive implementations
// ------------------------------------------------------------------------------------------------

impl Encode for u8 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(*self);
        Ok(())
    }
}

impl Decode for u8 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        Ok((buf[0], 1))
    }
}

impl Encode for u32 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u32 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[..4]);
        Ok((u32::from_le_bytes(bytes), 4))
    }
}

impl Encode for u64 {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(&self.to_le_bytes());
        Ok(())
    }
}

impl Decode for u64 {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&buf[..8]);
        Ok((u64::from_le_bytes(bytes), 8))
    }
}

impl Encode for bool {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.push(u8::from(*self));
        Ok(())
    }
}

impl Decode for bool {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 1)?;
        match buf[0] {
            0 => Ok((false, 1)),
            1 => Ok((true, 1)),
            other => Err(EncodingError::InvalidBool(other)),
        }
    }
}

impl Encode for [u8; 4] {
    #[inline]
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for [u8; 4] {
    #[inline]
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        require(buf, 4)?;
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&buf[..4]);
        Ok((bytes, 4))
    }
}

// ------------------------------------------------------------------------------------------------
// Byte strings and strings
// ------------------------------------------------------------------------------------------------

impl Encode for Vec<u8> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let len = len_to_u32(self.len(), "Vec<u8>")?;
        len.encode_to(buf)?;
        buf.extend_from_slice(self);
        Ok(())
    }
}

impl Decode for Vec<u8> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (len, offset) = u32::decode_from(buf)?;
        if len > MAX_BYTE_LEN {
            return Err(EncodingError::LengthOverflow {
                len: len as u64,
                limit: MAX_BYTE_LEN as u64,
                type_name: "Vec<u8>",
            });
        }
        let len = len as usize;
        require(&buf[offset..], len)?;
        Ok((buf[offset..offset + len].to_vec(), offset + len))
    }
}

impl Encode for String {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        let len = len_to_u32(self.len(), "String")?;
        len.encode_to(buf)?;
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }
}

impl Decode for String {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (bytes, consumed) = Vec::<u8>::decode_from(buf)?;
        Ok((String::from_utf8(bytes)?, consumed))
    }
}

// ------------------------------------------------------------------------------------------------
// Paths
// ------------------------------------------------------------------------------------------------

impl Encode for std::path::PathBuf {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        use std::os::unix::ffi::OsStrExt;
        self.as_os_str().as_bytes().to_vec().encode_to(buf)
    }
}

impl Decode for std::path::PathBuf {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        use std::os::unix::ffi::OsStrExt;
        let (bytes, consumed) = Vec::<u8>::decode_from(buf)?;
        Ok((
            std::path::PathBuf::from(std::ffi::OsStr::from_bytes(&bytes)),
            consumed,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Option
// ------------------------------------------------------------------------------------------------

impl<T: Encode> Encode for Option<T> {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            None => 0u8.encode_to(buf),
            Some(value) => {
                1u8.encode_to(buf)?;
                value.encode_to(buf)
            }
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (tag, offset) = u8::decode_from(buf)?;
        match tag {
            0 => Ok((None, offset)),
            1 => {
                let (value, n) = T::decode_from(&buf[offset..])?;
                Ok((Some(value), offset + n))
            }
            other => Err(EncodingError::InvalidTag {
                tag: other,
                type_name: "Option<T>",
            }),
        }
    }
}
