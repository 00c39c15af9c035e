#![forbid(unsafe_code)]
//! Shared types for the ext2 traversal crates.
//!
//! Unit-carrying newtypes (blocks, inodes, byte offsets), ext2 layout
//! constants, the parse-layer [`ParseError`], and the bounds-checked
//! byte readers every other crate routes its raw accesses through.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const EXT2_SUPERBLOCK_OFFSET: usize = 1024;
pub const EXT2_SUPERBLOCK_SIZE: usize = 1024;
pub const EXT2_SUPER_MAGIC: u16 = 0xEF53;

/// Smallest ext2 block size; every other size is this shifted left by
/// `s_log_block_size`.
pub const EXT2_MIN_BLOCK_SIZE: u32 = 1024;
/// Largest `s_log_block_size` accepted before the shift is treated as corrupt.
pub const EXT2_MAX_LOG_BLOCK_SIZE: u32 = 16;

/// Revision 0 images have a fixed 128-byte inode record.
pub const EXT2_GOOD_OLD_REV: u32 = 0;
pub const EXT2_GOOD_OLD_INODE_SIZE: u16 = 128;

/// Direct block pointers in `i_block`.
pub const EXT2_NDIR_BLOCKS: usize = 12;
/// Total pointers in `i_block` (direct + single/double/triple indirect).
pub const EXT2_N_BLOCKS: usize = 15;

/// Directory entry header: inode (4) + rec_len (2) + name_len (1) + file_type (1).
pub const EXT2_DIR_ENTRY_HEADER_LEN: usize = 8;
pub const EXT2_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// ext2 inode number (u32, 1-indexed; 0 means "no inode").
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u32);

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

/// Byte offset into an image buffer.
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

/// Validated block size (power of two, `1024 << log` with `log <= 16`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in the ext2 range.
    pub fn new(value: u32) -> Result<Self, ParseError> {
        let max = EXT2_MIN_BLOCK_SIZE << EXT2_MAX_LOG_BLOCK_SIZE;
        if !value.is_power_of_two() || !(EXT2_MIN_BLOCK_SIZE..=max).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 1024..=67108864",
            });
        }
        Ok(Self(value))
    }

    /// Derive the block size from the superblock's `s_log_block_size`.
    pub fn from_log(log_block_size: u32) -> Result<Self, ParseError> {
        if log_block_size > EXT2_MAX_LOG_BLOCK_SIZE {
            return Err(ParseError::InvalidField {
                field: "s_log_block_size",
                reason: "shift exceeds 16",
            });
        }
        let size = ext2_block_size_from_log(log_block_size).ok_or(ParseError::InvalidField {
            field: "s_log_block_size",
            reason: "invalid shift",
        })?;
        Self::new(size)
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Number of bits to shift to convert between bytes and blocks.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Convert a byte offset to a block number (truncating).
    #[must_use]
    pub fn byte_to_block(self, byte_offset: u64) -> BlockNumber {
        BlockNumber(byte_offset >> u64::from(self.shift()))
    }

    /// Convert a block number to a byte offset.
    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

impl BlockNumber {
    /// Convert this block number to its byte offset using the given block size.
    ///
    /// Returns `None` on overflow.
    #[must_use]
    pub fn to_byte_offset(self, block_size: BlockSize) -> Option<ByteOffset> {
        block_size.block_to_byte(self).map(ByteOffset)
    }
}

impl InodeNumber {
    pub const ROOT: Self = Self(2);

    /// Zero-based slot in the inode table, or `None` for inode 0.
    #[must_use]
    pub fn table_index(self) -> Option<u32> {
        self.0.checked_sub(1)
    }
}

impl ByteOffset {
    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        u64_to_usize(self.0, "byte_offset")
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("invalid argument: {field} ({reason})")]
    InvalidArgument {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

#[must_use]
pub fn ext2_block_size_from_log(log_block_size: u32) -> Option<u32> {
    let shift = 10_u32.checked_add(log_block_size)?;
    1_u32.checked_shl(shift)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

// ── Byte-buffer view ────────────────────────────────────────────────────────

/// Read-only, bounds-checked view over a whole filesystem image.
///
/// Every read takes an absolute byte offset and fails with
/// [`ParseError::InsufficientData`] when `offset + size` runs past the end
/// of the buffer. The view is `Copy` and borrows the caller's bytes; it
/// never copies them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteView<'a> {
    data: &'a [u8],
}

impl<'a> ByteView<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], ParseError> {
        ensure_slice(self.data, offset, len)
    }

    /// Borrow `len` bytes starting at a 64-bit image offset.
    pub fn slice_at(&self, offset: ByteOffset, len: usize) -> Result<&'a [u8], ParseError> {
        self.slice(offset.to_usize()?, len)
    }

    /// Narrow the view to `len` bytes starting at `offset`.
    pub fn sub_view(&self, offset: usize, len: usize) -> Result<Self, ParseError> {
        self.slice(offset, len).map(Self::new)
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8, ParseError> {
        read_u8(self.data, offset)
    }

    pub fn read_le_u16(&self, offset: usize) -> Result<u16, ParseError> {
        read_le_u16(self.data, offset)
    }

    pub fn read_le_u32(&self, offset: usize) -> Result<u32, ParseError> {
        read_le_u32(self.data, offset)
    }

    pub fn read_fixed<const N: usize>(&self, offset: usize) -> Result<[u8; N], ParseError> {
        read_fixed::<N>(self.data, offset)
    }
}

impl<'a> From<&'a [u8]> for ByteView<'a> {
    fn from(data: &'a [u8]) -> Self {
        Self::new(data)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── POSIX file mode constants ────────────────────────────────────────────────

/// File type mask (upper 4 bits of mode).
pub const S_IFMT: u16 = 0o170_000;
/// Named pipe (FIFO).
pub const S_IFIFO: u16 = 0o010_000;
/// Character device.
pub const S_IFCHR: u16 = 0o020_000;
/// Directory.
pub const S_IFDIR: u16 = 0o040_000;
/// Block device.
pub const S_IFBLK: u16 = 0o060_000;
/// Regular file.
pub const S_IFREG: u16 = 0o100_000;
/// Symbolic link.
pub const S_IFLNK: u16 = 0o120_000;
/// Socket.
pub const S_IFSOCK: u16 = 0o140_000;
