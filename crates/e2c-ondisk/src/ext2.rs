#![forbid(unsafe_code)]

use e2c_types::{
    BlockNumber, BlockSize, ByteOffset, ByteView, EXT2_DIR_ENTRY_HEADER_LEN, EXT2_GOOD_OLD_INODE_SIZE,
    EXT2_GOOD_OLD_REV, EXT2_N_BLOCKS, EXT2_NAME_LEN, EXT2_NDIR_BLOCKS, EXT2_SUPER_MAGIC,
    EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE, GroupNumber, InodeNumber, ParseError, S_IFBLK,
    S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT, S_IFREG, S_IFSOCK, read_le_u16, read_le_u32,
    read_u8, trim_nul_padded,
};
use serde::{Deserialize, Serialize};

/// Number of block groups this crate understands.
///
/// Only the descriptor of group 0 is ever read, and its inode table is
/// treated as the inode table of the whole filesystem. Images with more
/// groups still parse, but inodes living outside group 0 resolve to the
/// wrong record.
pub const ASSUMED_BLOCK_GROUPS: u32 = 1;

/// Well-known inode number of the root directory.
pub const ROOT_INODE_NUM: InodeNumber = InodeNumber::ROOT;

/// On-disk size of an ext2 block group descriptor.
pub const EXT2_GROUP_DESC_SIZE: usize = 32;

// ── Superblock ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Superblock {
    // ── Core geometry ────────────────────────────────────────────────────
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub reserved_blocks_count: u32,
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub first_data_block: u32,
    pub log_block_size: u32,
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,

    // ── Identity ─────────────────────────────────────────────────────────
    pub magic: u16,
    pub uuid: [u8; 16],
    pub volume_name: String,

    // ── State ────────────────────────────────────────────────────────────
    pub mtime: u32,
    pub wtime: u32,
    pub mnt_count: u16,
    pub state: u16,

    // ── Revision ─────────────────────────────────────────────────────────
    pub rev_level: u32,
    /// First non-reserved inode (dynamic revision only; 11 otherwise).
    pub first_ino: u32,
    /// Raw `s_inode_size`; meaningful only when `rev_level > 0`.
    pub inode_size: u16,
}

impl Ext2Superblock {
    /// Parse an ext2 superblock from a 1024-byte superblock region.
    ///
    /// No field is validated here; call [`Ext2Superblock::block_size`] and
    /// [`Ext2Superblock::validate`] for the structural checks.
    pub fn parse_superblock_region(region: &[u8]) -> Result<Self, ParseError> {
        if region.len() < EXT2_SUPERBLOCK_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_SUPERBLOCK_SIZE,
                offset: 0,
                actual: region.len(),
            });
        }

        let view = ByteView::new(region);
        let rev_level = view.read_le_u32(0x4C)?;
        let (first_ino, inode_size) = if rev_level == EXT2_GOOD_OLD_REV {
            (11, EXT2_GOOD_OLD_INODE_SIZE)
        } else {
            (view.read_le_u32(0x54)?, view.read_le_u16(0x58)?)
        };

        Ok(Self {
            inodes_count: view.read_le_u32(0x00)?,
            blocks_count: view.read_le_u32(0x04)?,
            reserved_blocks_count: view.read_le_u32(0x08)?,
            free_blocks_count: view.read_le_u32(0x0C)?,
            free_inodes_count: view.read_le_u32(0x10)?,
            first_data_block: view.read_le_u32(0x14)?,
            log_block_size: view.read_le_u32(0x18)?,
            blocks_per_group: view.read_le_u32(0x20)?,
            inodes_per_group: view.read_le_u32(0x28)?,

            magic: view.read_le_u16(0x38)?,
            uuid: view.read_fixed::<16>(0x68)?,
            volume_name: trim_nul_padded(&view.read_fixed::<16>(0x78)?),

            mtime: view.read_le_u32(0x2C)?,
            wtime: view.read_le_u32(0x30)?,
            mnt_count: view.read_le_u16(0x34)?,
            state: view.read_le_u16(0x3A)?,

            rev_level,
            first_ino,
            inode_size,
        })
    }

    /// Locate and parse the superblock at byte 1024 of a full image.
    pub fn parse_from_image(image: &[u8]) -> Result<Self, ParseError> {
        let region =
            ByteView::new(image).sub_view(EXT2_SUPERBLOCK_OFFSET, EXT2_SUPERBLOCK_SIZE)?;
        Self::parse_superblock_region(region.as_bytes())
    }

    /// Block size, `1024 << s_log_block_size`.
    pub fn block_size(&self) -> Result<BlockSize, ParseError> {
        BlockSize::from_log(self.log_block_size)
    }

    #[must_use]
    pub fn has_valid_magic(&self) -> bool {
        self.magic == EXT2_SUPER_MAGIC
    }

    /// Size of one inode table record.
    ///
    /// Revision 0 images always use 128 bytes; dynamic-revision images
    /// record the size in `s_inode_size`, which must be a power of two no
    /// smaller than 128.
    pub fn inode_record_size(&self) -> Result<u16, ParseError> {
        if self.rev_level == EXT2_GOOD_OLD_REV {
            return Ok(EXT2_GOOD_OLD_INODE_SIZE);
        }
        if self.inode_size < EXT2_GOOD_OLD_INODE_SIZE || !self.inode_size.is_power_of_two() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "must be a power of two >= 128",
            });
        }
        Ok(self.inode_size)
    }

    /// Number of block groups described by the geometry fields.
    ///
    /// Returns 0 when `s_blocks_per_group` is 0.
    #[must_use]
    pub fn group_count(&self) -> u32 {
        if self.blocks_per_group == 0 {
            return 0;
        }
        self.blocks_count
            .saturating_sub(self.first_data_block)
            .div_ceil(self.blocks_per_group)
    }

    /// Structural checks a real ext2 image must pass.
    pub fn validate(&self) -> Result<(), ParseError> {
        if !self.has_valid_magic() {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(EXT2_SUPER_MAGIC),
                actual: u64::from(self.magic),
            });
        }
        let block_size = self.block_size()?;
        let inode_size = self.inode_record_size()?;
        if u32::from(inode_size) > block_size.get() {
            return Err(ParseError::InvalidField {
                field: "s_inode_size",
                reason: "inode size exceeds block size",
            });
        }
        Ok(())
    }
}

/// Read the superblock of `image`.
pub fn read_superblock(image: &[u8]) -> Result<Ext2Superblock, ParseError> {
    Ext2Superblock::parse_from_image(image)
}

// ── Block addressing ────────────────────────────────────────────────────────

/// Byte offset of `block`: `block * block_size`. Block 0 is byte 0.
pub fn block_offset(block_size: BlockSize, block: BlockNumber) -> Result<ByteOffset, ParseError> {
    block.to_byte_offset(block_size).ok_or(ParseError::InvalidField {
        field: "block_offset",
        reason: "overflow computing block byte offset",
    })
}

/// Borrow one whole block of the image.
pub fn read_block(
    image: &[u8],
    block_size: BlockSize,
    block: BlockNumber,
) -> Result<&[u8], ParseError> {
    let offset = block_offset(block_size, block)?;
    ByteView::new(image).slice_at(offset, block_size.as_usize())
}

// ── Block group descriptor ──────────────────────────────────────────────────

/// Block holding the group descriptor table: the one right after the block
/// that contains the superblock (block 2 for 1 KiB blocks, block 1 for
/// anything larger).
#[must_use]
pub fn group_desc_table_block(block_size: BlockSize) -> BlockNumber {
    let superblock_block = EXT2_SUPERBLOCK_OFFSET as u64 / u64::from(block_size.get());
    BlockNumber(superblock_block + 1)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2GroupDesc {
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub free_blocks_count: u16,
    pub free_inodes_count: u16,
    pub used_dirs_count: u16,
}

impl Ext2GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < EXT2_GROUP_DESC_SIZE {
            return Err(ParseError::InsufficientData {
                needed: EXT2_GROUP_DESC_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let view = ByteView::new(bytes);
        Ok(Self {
            block_bitmap: view.read_le_u32(0x00)?,
            inode_bitmap: view.read_le_u32(0x04)?,
            inode_table: view.read_le_u32(0x08)?,
            free_blocks_count: view.read_le_u16(0x0C)?,
            free_inodes_count: view.read_le_u16(0x0E)?,
            used_dirs_count: view.read_le_u16(0x10)?,
        })
    }

    #[must_use]
    pub fn inode_table_start_block(&self) -> BlockNumber {
        BlockNumber(u64::from(self.inode_table))
    }
}

/// Read the descriptor of `group`, which must be below [`ASSUMED_BLOCK_GROUPS`].
pub fn read_group_desc(
    image: &[u8],
    block_size: BlockSize,
    group: GroupNumber,
) -> Result<Ext2GroupDesc, ParseError> {
    if group.0 >= ASSUMED_BLOCK_GROUPS {
        return Err(ParseError::InvalidArgument {
            field: "block_group",
            reason: "only a single block group is supported",
        });
    }
    let table = block_offset(block_size, group_desc_table_block(block_size))?;
    let desc_offset = u64::from(group.0) * EXT2_GROUP_DESC_SIZE as u64;
    let offset = table
        .checked_add(desc_offset)
        .ok_or(ParseError::InvalidField {
            field: "group_desc_offset",
            reason: "overflow computing group descriptor offset",
        })?;
    let bytes = ByteView::new(image).slice_at(offset, EXT2_GROUP_DESC_SIZE)?;
    Ext2GroupDesc::parse_from_bytes(bytes)
}

/// Read the (single) block group descriptor.
pub fn read_block_group(image: &[u8], block_size: BlockSize) -> Result<Ext2GroupDesc, ParseError> {
    read_group_desc(image, block_size, GroupNumber(0))
}

// ── Inodes ──────────────────────────────────────────────────────────────────

/// ext2 file type constants from directory entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Ext2FileType {
    Unknown = 0,
    RegFile = 1,
    Dir = 2,
    Chrdev = 3,
    Blkdev = 4,
    Fifo = 5,
    Sock = 6,
    Symlink = 7,
}

impl Ext2FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::RegFile,
            2 => Self::Dir,
            3 => Self::Chrdev,
            4 => Self::Blkdev,
            5 => Self::Fifo,
            6 => Self::Sock,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    /// Derive the directory-entry tag from inode mode bits.
    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::RegFile,
            S_IFDIR => Self::Dir,
            S_IFCHR => Self::Chrdev,
            S_IFBLK => Self::Blkdev,
            S_IFIFO => Self::Fifo,
            S_IFSOCK => Self::Sock,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2Inode {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u64,
    pub links_count: u16,
    /// 512-byte sectors allocated.
    pub blocks: u32,
    pub flags: u32,

    pub atime: u32,
    pub ctime: u32,
    pub mtime: u32,
    pub dtime: u32,

    /// `i_block`: 12 direct pointers, then single, double and triple indirect.
    pub block: [u32; EXT2_N_BLOCKS],
}

impl Ext2Inode {
    /// Parse an ext2 inode from the first 128 bytes of its record.
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        let base = usize::from(EXT2_GOOD_OLD_INODE_SIZE);
        if bytes.len() < base {
            return Err(ParseError::InsufficientData {
                needed: base,
                offset: 0,
                actual: bytes.len(),
            });
        }

        let view = ByteView::new(bytes);
        let mode = view.read_le_u16(0x00)?;
        let size_lo = u64::from(view.read_le_u32(0x04)?);
        // i_size_high is i_dir_acl on directories; only regular files use it.
        let size = if mode & S_IFMT == S_IFREG {
            size_lo | (u64::from(view.read_le_u32(0x6C)?) << 32)
        } else {
            size_lo
        };

        let mut block = [0_u32; EXT2_N_BLOCKS];
        for (i, slot) in block.iter_mut().enumerate() {
            *slot = view.read_le_u32(0x28 + i * 4)?;
        }

        Ok(Self {
            mode,
            uid: view.read_le_u16(0x02)?,
            gid: view.read_le_u16(0x18)?,
            size,
            links_count: view.read_le_u16(0x1A)?,
            blocks: view.read_le_u32(0x1C)?,
            flags: view.read_le_u32(0x20)?,

            atime: view.read_le_u32(0x08)?,
            ctime: view.read_le_u32(0x0C)?,
            mtime: view.read_le_u32(0x10)?,
            dtime: view.read_le_u32(0x14)?,

            block,
        })
    }

    #[must_use]
    pub fn file_type(&self) -> Ext2FileType {
        Ext2FileType::from_mode(self.mode)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    /// Permission bits (lower 12 bits of mode).
    #[must_use]
    pub fn permissions(&self) -> u16 {
        self.mode & 0o7777
    }

    /// Direct block pointer `index` (0..12); 0 means unallocated.
    #[must_use]
    pub fn direct_block(&self, index: usize) -> Option<BlockNumber> {
        if index >= EXT2_NDIR_BLOCKS {
            return None;
        }
        match self.block[index] {
            0 => None,
            b => Some(BlockNumber(u64::from(b))),
        }
    }
}

/// Location and stride of the inode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeTable {
    pub start_block: BlockNumber,
    pub block_size: BlockSize,
    pub record_size: u16,
}

impl InodeTable {
    #[must_use]
    pub fn new(start_block: BlockNumber, block_size: BlockSize, record_size: u16) -> Self {
        Self {
            start_block,
            block_size,
            record_size,
        }
    }

    /// Byte offset of the first inode record.
    pub fn start_offset(&self) -> Result<ByteOffset, ParseError> {
        block_offset(self.block_size, self.start_block)
    }
}

/// Byte offset of inode `ino`: `table_start + (ino - 1) * record_size`.
pub fn inode_offset(table: &InodeTable, ino: InodeNumber) -> Result<ByteOffset, ParseError> {
    let index = ino.table_index().ok_or(ParseError::InvalidArgument {
        field: "inode_number",
        reason: "inode numbers are 1-based; 0 is invalid",
    })?;
    let within = u64::from(index) * u64::from(table.record_size);
    table
        .start_offset()?
        .checked_add(within)
        .ok_or(ParseError::InvalidField {
            field: "inode_offset",
            reason: "overflow computing inode byte offset",
        })
}

/// Read inode `ino` from the inode table.
pub fn read_inode(
    image: &[u8],
    table: &InodeTable,
    ino: InodeNumber,
) -> Result<Ext2Inode, ParseError> {
    let offset = inode_offset(table, ino)?;
    let bytes = ByteView::new(image).slice_at(offset, usize::from(table.record_size))?;
    Ext2Inode::parse_from_bytes(bytes)
}

/// Read the root directory inode.
pub fn root_inode(image: &[u8], table: &InodeTable) -> Result<Ext2Inode, ParseError> {
    read_inode(image, table, ROOT_INODE_NUM)
}

// ── Directory entries ───────────────────────────────────────────────────────

/// A parsed ext2 directory entry (`ext2_dir_entry_2`) with owned name bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ext2DirEntry {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: Vec<u8>,
}

impl Ext2DirEntry {
    /// Return the name as a UTF-8 string (lossy).
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// A borrowed directory entry (zero-copy reference into the block buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext2DirEntryRef<'a> {
    pub inode: u32,
    pub rec_len: u16,
    pub name_len: u8,
    pub file_type: Ext2FileType,
    pub name: &'a [u8],
}

impl Ext2DirEntryRef<'_> {
    /// Convert to an owned [`Ext2DirEntry`] (allocates name bytes).
    #[must_use]
    pub fn to_owned(&self) -> Ext2DirEntry {
        Ext2DirEntry {
            inode: self.inode,
            rec_len: self.rec_len,
            name_len: self.name_len,
            file_type: self.file_type,
            name: self.name.to_vec(),
        }
    }

    #[must_use]
    pub fn inode_number(&self) -> InodeNumber {
        InodeNumber(self.inode)
    }

    /// Exact match: same length, then same bytes.
    ///
    /// A stored `"foo"` matches neither `"fo"` nor `"foobar"`.
    #[must_use]
    pub fn name_matches(&self, target: &[u8]) -> bool {
        usize::from(self.name_len) == target.len() && self.name == target
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(self.name).into_owned()
    }

    #[must_use]
    pub fn is_dot(&self) -> bool {
        self.name == b"."
    }

    #[must_use]
    pub fn is_dotdot(&self) -> bool {
        self.name == b".."
    }
}

/// Largest value the 16-bit `rec_len` field can hold.
const EXT2_MAX_REC_LEN: u16 = u16::MAX;

/// Decode an on-disk `rec_len`.
///
/// A 64 KiB record does not fit in 16 bits, so a 64 KiB block whose only
/// record spans the whole block stores it as 65535. Zero stays zero and is
/// rejected by the scanner.
fn rec_len_from_disk(raw: u16, block_len: usize) -> usize {
    const LARGE_BLOCK: usize = 1 << 16;
    if raw == EXT2_MAX_REC_LEN && block_len >= LARGE_BLOCK {
        LARGE_BLOCK
    } else {
        usize::from(raw)
    }
}

/// A zero-allocation iterator over the directory entries of one block.
///
/// Yields `Result<Ext2DirEntryRef<'a>, ParseError>` for each live entry,
/// stepping over deleted slots (inode 0). The walk is bounded by the length
/// of `block`, not by the `rec_len` chain: a `rec_len` below the header
/// size (including 0), a record reaching past the block end, a name longer
/// than its record, or a tail too short for a header all end the iteration
/// with an `InvalidField` error. After an error the iterator is fused.
///
/// The iterator is `Clone`, so a scan can be restarted from any position.
#[derive(Debug, Clone)]
pub struct DirBlockIter<'a> {
    block: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> DirBlockIter<'a> {
    /// Create a new iterator over directory entries in `block`.
    #[must_use]
    pub fn new(block: &'a [u8]) -> Self {
        Self {
            block,
            offset: 0,
            done: false,
        }
    }

    /// Byte position of the next record within the block.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }

    fn step(&mut self) -> Result<Option<Ext2DirEntryRef<'a>>, ParseError> {
        loop {
            if self.offset == self.block.len() {
                return Ok(None);
            }
            if self.offset + EXT2_DIR_ENTRY_HEADER_LEN > self.block.len() {
                return Err(ParseError::InvalidField {
                    field: "de_rec_len",
                    reason: "rec_len chain ends short of block boundary",
                });
            }

            let inode = read_le_u32(self.block, self.offset)?;
            let rec_len = read_le_u16(self.block, self.offset + 4)?;
            let record_len = rec_len_from_disk(rec_len, self.block.len());
            let name_len = read_u8(self.block, self.offset + 6)?;
            let file_type_raw = read_u8(self.block, self.offset + 7)?;

            if record_len < EXT2_DIR_ENTRY_HEADER_LEN {
                return Err(ParseError::InvalidField {
                    field: "de_rec_len",
                    reason: "directory entry rec_len < 8",
                });
            }
            let entry_end = self.offset + record_len;
            if entry_end > self.block.len() {
                return Err(ParseError::InvalidField {
                    field: "de_rec_len",
                    reason: "directory entry extends past block boundary",
                });
            }

            if inode == 0 {
                self.offset = entry_end;
                continue;
            }

            let name_start = self.offset + EXT2_DIR_ENTRY_HEADER_LEN;
            let name_end = name_start + usize::from(name_len);
            if name_end > entry_end {
                return Err(ParseError::InvalidField {
                    field: "de_name_len",
                    reason: "name extends past rec_len",
                });
            }

            let name = &self.block[name_start..name_end];
            self.offset = entry_end;

            return Ok(Some(Ext2DirEntryRef {
                inode,
                rec_len,
                name_len,
                file_type: Ext2FileType::from_raw(file_type_raw),
                name,
            }));
        }
    }
}

impl<'a> Iterator for DirBlockIter<'a> {
    type Item = Result<Ext2DirEntryRef<'a>, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.step() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl std::iter::FusedIterator for DirBlockIter<'_> {}

/// Create an iterator over directory entries in a block buffer.
#[must_use]
pub fn iter_dir_block(block: &[u8]) -> DirBlockIter<'_> {
    DirBlockIter::new(block)
}

/// Parse all live directory entries from a single directory block.
pub fn parse_dir_block(block: &[u8]) -> Result<Vec<Ext2DirEntry>, ParseError> {
    iter_dir_block(block)
        .map(|entry| entry.map(|e| e.to_owned()))
        .collect()
}

/// Look up a single name in a directory block.
///
/// Stops at the first exact match; a corrupt record seen before the match
/// is reported as an error.
pub fn lookup_in_dir_block<'a>(
    block: &'a [u8],
    target: &[u8],
) -> Result<Option<Ext2DirEntryRef<'a>>, ParseError> {
    lookup_in_dir_block_with(block, target, |_| {})
}

/// [`lookup_in_dir_block`], calling `on_entry` for every live entry
/// inspected (the match included).
pub fn lookup_in_dir_block_with<'a, F>(
    block: &'a [u8],
    target: &[u8],
    mut on_entry: F,
) -> Result<Option<Ext2DirEntryRef<'a>>, ParseError>
where
    F: FnMut(&Ext2DirEntryRef<'a>),
{
    for entry in iter_dir_block(block) {
        let entry = entry?;
        on_entry(&entry);
        if entry.name_matches(target) {
            return Ok(Some(entry));
        }
    }
    Ok(None)
}

/// Borrow the first data block of a directory inode.
///
/// Only the first direct block is scanned; entries living in later blocks
/// of a multi-block directory are not visible. In a 64 KiB block a record
/// spanning the whole block carries `rec_len` 65535, which the scanner
/// decodes as 65536.
pub fn directory_block<'a>(
    image: &'a [u8],
    block_size: BlockSize,
    dir: &Ext2Inode,
) -> Result<&'a [u8], ParseError> {
    if !dir.is_dir() {
        return Err(ParseError::InvalidField {
            field: "i_mode",
            reason: "inode is not a directory",
        });
    }
    let block = dir.direct_block(0).ok_or(ParseError::InvalidField {
        field: "i_block",
        reason: "directory has no data block",
    })?;
    read_block(image, block_size, block)
}

/// Find `name` in directory `dir`, returning the entry's inode number.
///
/// `Ok(None)` means the directory is well formed and has no such entry.
pub fn find_entry(
    image: &[u8],
    block_size: BlockSize,
    dir: &Ext2Inode,
    name: &[u8],
) -> Result<Option<InodeNumber>, ParseError> {
    find_entry_with(image, block_size, dir, name, |_| {})
}

/// [`find_entry`], calling `on_entry` for every live entry inspected.
///
/// Empty names and names longer than 255 bytes match nothing and skip the
/// scan.
pub fn find_entry_with<F>(
    image: &[u8],
    block_size: BlockSize,
    dir: &Ext2Inode,
    name: &[u8],
    on_entry: F,
) -> Result<Option<InodeNumber>, ParseError>
where
    F: for<'b> FnMut(&Ext2DirEntryRef<'b>),
{
    let block = directory_block(image, block_size, dir)?;
    if name.is_empty() || name.len() > EXT2_NAME_LEN {
        return Ok(None);
    }
    Ok(lookup_in_dir_block_with(block, name, on_entry)?.map(|e| e.inode_number()))
}

/// List the live entries of directory `dir` (first data block only).
pub fn list_entries(
    image: &[u8],
    block_size: BlockSize,
    dir: &Ext2Inode,
) -> Result<Vec<Ext2DirEntry>, ParseError> {
    parse_dir_block(directory_block(image, block_size, dir)?)
}

// ── High-level image reader ─────────────────────────────────────────────────

/// Parsed context for reading ext2 structures from an image.
///
/// Caches the superblock, block size and inode table location so repeated
/// lookups avoid re-parsing them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ext2ImageReader {
    pub sb: Ext2Superblock,
    pub block_size: BlockSize,
    pub group_desc: Ext2GroupDesc,
    pub inode_table: InodeTable,
}

impl Ext2ImageReader {
    /// Parse the superblock and group descriptor of `image`.
    pub fn new(image: &[u8]) -> Result<Self, ParseError> {
        let sb = read_superblock(image)?;
        let block_size = sb.block_size()?;
        let record_size = sb.inode_record_size()?;
        let group_desc = read_block_group(image, block_size)?;
        let inode_table = InodeTable::new(
            group_desc.inode_table_start_block(),
            block_size,
            record_size,
        );
        Ok(Self {
            sb,
            block_size,
            group_desc,
            inode_table,
        })
    }

    pub fn read_inode(&self, image: &[u8], ino: InodeNumber) -> Result<Ext2Inode, ParseError> {
        read_inode(image, &self.inode_table, ino)
    }

    pub fn root_inode(&self, image: &[u8]) -> Result<Ext2Inode, ParseError> {
        root_inode(image, &self.inode_table)
    }

    pub fn read_block<'a>(
        &self,
        image: &'a [u8],
        block: BlockNumber,
    ) -> Result<&'a [u8], ParseError> {
        read_block(image, self.block_size, block)
    }

    pub fn find_entry(
        &self,
        image: &[u8],
        dir: &Ext2Inode,
        name: &[u8],
    ) -> Result<Option<InodeNumber>, ParseError> {
        find_entry(image, self.block_size, dir, name)
    }

    pub fn list_entries(
        &self,
        image: &[u8],
        dir: &Ext2Inode,
    ) -> Result<Vec<Ext2DirEntry>, ParseError> {
        list_entries(image, self.block_size, dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BS: usize = 1024;
    const INODE_TABLE_BLOCK: u32 = 5;

    fn put_u16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }

    fn put_u32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Pack `(inode, name, file_type)` records into one block; the last
    /// record's rec_len runs to the end of the block.
    fn dir_block(entries: &[(u32, &str, u8)], block_size: usize) -> Vec<u8> {
        let mut block = vec![0_u8; block_size];
        let mut offset = 0;
        for (i, (ino, name, ft)) in entries.iter().enumerate() {
            let min = (8 + name.len() + 3) & !3;
            let rec_len = if i + 1 == entries.len() {
                block_size - offset
            } else {
                min
            };
            put_u32(&mut block, offset, *ino);
            put_u16(&mut block, offset + 4, u16::try_from(rec_len).unwrap());
            block[offset + 6] = u8::try_from(name.len()).unwrap();
            block[offset + 7] = *ft;
            block[offset + 8..offset + 8 + name.len()].copy_from_slice(name.as_bytes());
            offset += rec_len;
        }
        block
    }

    fn put_inode(image: &mut [u8], ino: u32, mode: u16, size: u32, first_block: u32) {
        let off = INODE_TABLE_BLOCK as usize * BS + (ino as usize - 1) * 128;
        put_u16(image, off, mode);
        put_u32(image, off + 0x04, size);
        put_u16(image, off + 0x1A, 1);
        put_u32(image, off + 0x28, first_block);
    }

    /// 1 KiB-block image: root (2) → etc (11) → motd (15).
    fn sample_image() -> Vec<u8> {
        let mut image = vec![0_u8; 16 * BS];
        let sb = EXT2_SUPERBLOCK_OFFSET;
        put_u32(&mut image, sb, 32); // inodes_count
        put_u32(&mut image, sb + 0x04, 16); // blocks_count
        put_u32(&mut image, sb + 0x14, 1); // first_data_block
        put_u32(&mut image, sb + 0x18, 0); // log_block_size -> 1K
        put_u32(&mut image, sb + 0x20, 8192); // blocks_per_group
        put_u32(&mut image, sb + 0x28, 32); // inodes_per_group
        put_u16(&mut image, sb + 0x38, EXT2_SUPER_MAGIC);

        let gd = 2 * BS;
        put_u32(&mut image, gd, 3);
        put_u32(&mut image, gd + 0x04, 4);
        put_u32(&mut image, gd + 0x08, INODE_TABLE_BLOCK);

        put_inode(&mut image, 2, S_IFDIR | 0o755, 1024, 10);
        put_inode(&mut image, 11, S_IFDIR | 0o755, 1024, 11);
        put_inode(&mut image, 15, S_IFREG | 0o644, 6, 12);

        let root = dir_block(&[(2, ".", 2), (2, "..", 2), (11, "etc", 2)], BS);
        image[10 * BS..11 * BS].copy_from_slice(&root);
        let etc = dir_block(&[(11, ".", 2), (2, "..", 2), (15, "motd", 1)], BS);
        image[11 * BS..12 * BS].copy_from_slice(&etc);
        image[12 * BS..12 * BS + 6].copy_from_slice(b"hello\n");
        image
    }

    fn bs1k() -> BlockSize {
        BlockSize::new(1024).unwrap()
    }

    #[test]
    fn parse_superblock_from_image() {
        let image = sample_image();
        let sb = read_superblock(&image).expect("superblock");
        assert_eq!(sb.inodes_count, 32);
        assert_eq!(sb.first_data_block, 1);
        assert!(sb.has_valid_magic());
        assert_eq!(sb.block_size().expect("block size").get(), 1024);
        assert_eq!(sb.inode_record_size().expect("inode size"), 128);
        assert_eq!(sb.group_count(), 1);
        sb.validate().expect("valid");
    }

    #[test]
    fn superblock_on_truncated_image_is_insufficient_data() {
        let image = vec![0_u8; 1500];
        assert!(matches!(
            read_superblock(&image),
            Err(ParseError::InsufficientData {
                needed: 1024,
                offset: 1024,
                ..
            })
        ));
    }

    #[test]
    fn block_size_rejects_oversized_shift() {
        let mut image = sample_image();
        put_u32(&mut image, EXT2_SUPERBLOCK_OFFSET + 0x18, 17);
        let sb = read_superblock(&image).expect("parse is lenient");
        assert!(matches!(
            sb.block_size(),
            Err(ParseError::InvalidField {
                field: "s_log_block_size",
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_bad_magic() {
        let mut image = sample_image();
        put_u16(&mut image, EXT2_SUPERBLOCK_OFFSET + 0x38, 0x1234);
        let sb = read_superblock(&image).expect("parse");
        assert!(matches!(
            sb.validate(),
            Err(ParseError::InvalidMagic {
                expected: 0xEF53,
                actual: 0x1234
            })
        ));
    }

    #[test]
    fn dynamic_revision_uses_recorded_inode_size() {
        let mut image = sample_image();
        put_u32(&mut image, EXT2_SUPERBLOCK_OFFSET + 0x4C, 1);
        put_u32(&mut image, EXT2_SUPERBLOCK_OFFSET + 0x54, 11);
        put_u16(&mut image, EXT2_SUPERBLOCK_OFFSET + 0x58, 256);
        let sb = read_superblock(&image).expect("parse");
        assert_eq!(sb.inode_record_size().expect("size"), 256);

        put_u16(&mut image, EXT2_SUPERBLOCK_OFFSET + 0x58, 200);
        let sb = read_superblock(&image).expect("parse");
        assert!(matches!(
            sb.inode_record_size(),
            Err(ParseError::InvalidField {
                field: "s_inode_size",
                ..
            })
        ));
    }

    #[test]
    fn block_zero_is_image_start() {
        assert_eq!(block_offset(bs1k(), BlockNumber(0)), Ok(ByteOffset(0)));
        assert_eq!(block_offset(bs1k(), BlockNumber(7)), Ok(ByteOffset(7168)));
        assert!(matches!(
            block_offset(bs1k(), BlockNumber(u64::MAX)),
            Err(ParseError::InvalidField {
                field: "block_offset",
                ..
            })
        ));
    }

    #[test]
    fn group_desc_table_follows_superblock_block() {
        assert_eq!(group_desc_table_block(bs1k()), BlockNumber(2));
        assert_eq!(
            group_desc_table_block(BlockSize::new(2048).unwrap()),
            BlockNumber(1)
        );
        assert_eq!(
            group_desc_table_block(BlockSize::new(4096).unwrap()),
            BlockNumber(1)
        );
    }

    #[test]
    fn read_block_group_finds_inode_table() {
        let image = sample_image();
        let gd = read_block_group(&image, bs1k()).expect("group desc");
        assert_eq!(gd.block_bitmap, 3);
        assert_eq!(gd.inode_bitmap, 4);
        assert_eq!(gd.inode_table_start_block(), BlockNumber(5));
    }

    #[test]
    fn only_group_zero_is_addressable() {
        let image = sample_image();
        assert!(matches!(
            read_group_desc(&image, bs1k(), GroupNumber(1)),
            Err(ParseError::InvalidArgument {
                field: "block_group",
                ..
            })
        ));
    }

    #[test]
    fn inode_zero_is_invalid_argument() {
        let image = sample_image();
        let table = InodeTable::new(BlockNumber(5), bs1k(), 128);
        assert!(matches!(
            read_inode(&image, &table, InodeNumber(0)),
            Err(ParseError::InvalidArgument {
                field: "inode_number",
                ..
            })
        ));
    }

    #[test]
    fn inode_past_image_end_is_insufficient_data() {
        let image = sample_image();
        let table = InodeTable::new(BlockNumber(5), bs1k(), 128);
        assert!(matches!(
            read_inode(&image, &table, InodeNumber(1000)),
            Err(ParseError::InsufficientData { .. })
        ));
    }

    #[test]
    fn root_inode_is_directory() {
        let image = sample_image();
        let reader = Ext2ImageReader::new(&image).expect("reader");
        let root = reader.root_inode(&image).expect("root");
        assert!(root.is_dir());
        assert_eq!(root.permissions(), 0o755);
        assert_eq!(root.direct_block(0), Some(BlockNumber(10)));
        assert_eq!(root.direct_block(1), None);
        assert_eq!(root.direct_block(12), None);

        let motd = reader.read_inode(&image, InodeNumber(15)).expect("motd");
        assert!(motd.is_regular());
        assert!(!motd.is_symlink());
        assert_eq!(motd.file_type(), Ext2FileType::RegFile);
        assert_eq!(motd.size, 6);
    }

    #[test]
    fn symlink_mode_is_recognized() {
        let mut record = [0_u8; 128];
        put_u16(&mut record, 0, S_IFLNK | 0o777);
        let inode = Ext2Inode::parse_from_bytes(&record).expect("inode");
        assert!(inode.is_symlink());
        assert!(!inode.is_dir());
        assert_eq!(inode.file_type(), Ext2FileType::Symlink);
    }

    #[test]
    fn find_entry_matches_exact_names_only() {
        let image = sample_image();
        let reader = Ext2ImageReader::new(&image).expect("reader");
        let root = reader.root_inode(&image).expect("root");
        assert_eq!(
            reader.find_entry(&image, &root, b"etc").expect("scan"),
            Some(InodeNumber(11))
        );
        assert_eq!(reader.find_entry(&image, &root, b"et").expect("scan"), None);
        assert_eq!(reader.find_entry(&image, &root, b"etcx").expect("scan"), None);
        assert_eq!(reader.find_entry(&image, &root, b"").expect("scan"), None);
    }

    #[test]
    fn find_entry_rejects_non_directory() {
        let image = sample_image();
        let reader = Ext2ImageReader::new(&image).expect("reader");
        let motd = reader.read_inode(&image, InodeNumber(15)).expect("motd");
        assert!(matches!(
            reader.find_entry(&image, &motd, b"x"),
            Err(ParseError::InvalidField { field: "i_mode", .. })
        ));
    }

    #[test]
    fn find_entry_rejects_directory_without_block() {
        let mut image = sample_image();
        put_inode(&mut image, 11, S_IFDIR | 0o755, 0, 0);
        let reader = Ext2ImageReader::new(&image).expect("reader");
        let etc = reader.read_inode(&image, InodeNumber(11)).expect("etc");
        assert!(matches!(
            reader.find_entry(&image, &etc, b"motd"),
            Err(ParseError::InvalidField {
                field: "i_block",
                ..
            })
        ));
    }

    #[test]
    fn list_entries_includes_dot_entries() {
        let image = sample_image();
        let reader = Ext2ImageReader::new(&image).expect("reader");
        let root = reader.root_inode(&image).expect("root");
        let entries = reader.list_entries(&image, &root).expect("list");
        let names: Vec<String> = entries.iter().map(Ext2DirEntry::name_str).collect();
        assert_eq!(names, vec![".", "..", "etc"]);
        assert!(entries[0].is_dot());
        assert!(entries[1].is_dotdot());
        assert_eq!(entries[2].file_type, Ext2FileType::Dir);
        assert_eq!(entries[2].rec_len, 1024 - 12 - 12);
    }

    #[test]
    fn lookup_reports_every_inspected_entry() {
        let block = dir_block(&[(5, "a", 1), (6, "b", 1), (7, "c", 1)], BS);
        let mut seen = Vec::new();
        let found = lookup_in_dir_block_with(&block, b"b", |e| seen.push(e.inode)).expect("scan");
        assert_eq!(found.map(|e| e.inode), Some(6));
        assert_eq!(seen, vec![5, 6]);

        seen.clear();
        assert!(lookup_in_dir_block_with(&block, b"z", |e| seen.push(e.inode))
            .expect("scan")
            .is_none());
        assert_eq!(seen, vec![5, 6, 7]);
    }

    #[test]
    fn dir_iter_skips_deleted_entries() {
        let mut block = dir_block(&[(5, "gone", 1), (6, "kept", 1)], BS);
        put_u32(&mut block, 0, 0);
        let entries = parse_dir_block(&block).expect("parse");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"kept");
        assert_eq!(lookup_in_dir_block(&block, b"gone").expect("scan"), None);
    }

    #[test]
    fn dir_iter_zero_rec_len_is_corruption() {
        let mut block = dir_block(&[(5, "a", 1), (6, "b", 1), (7, "c", 1)], BS);
        // rec_len of the second record.
        put_u16(&mut block, 12 + 4, 0);
        let mut iter = iter_dir_block(&block);
        assert!(matches!(iter.next(), Some(Ok(e)) if e.name == b"a"));
        assert!(matches!(
            iter.next(),
            Some(Err(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "directory entry rec_len < 8"
            }))
        ));
        assert!(iter.next().is_none());
        assert!(iter.offset() <= BS);
    }

    #[test]
    fn dir_iter_rec_len_past_block_is_corruption() {
        let mut block = dir_block(&[(5, "a", 1), (6, "b", 1)], BS);
        put_u16(&mut block, 12 + 4, 2048);
        let err = lookup_in_dir_block(&block, b"zzz").expect_err("corrupt");
        assert!(matches!(
            err,
            ParseError::InvalidField {
                reason: "directory entry extends past block boundary",
                ..
            }
        ));
    }

    #[test]
    fn dir_iter_name_past_record_is_corruption() {
        let mut block = dir_block(&[(5, "abc", 1), (6, "b", 1)], BS);
        block[6] = 200;
        assert!(matches!(
            parse_dir_block(&block),
            Err(ParseError::InvalidField {
                field: "de_name_len",
                ..
            })
        ));
    }

    #[test]
    fn dir_iter_short_tail_is_corruption() {
        let mut block = dir_block(&[(5, "a", 1), (6, "b", 1)], BS);
        // Second record stops 4 bytes short of the block end.
        put_u16(&mut block, 12 + 4, u16::try_from(BS - 12 - 4).unwrap());
        assert!(matches!(
            parse_dir_block(&block),
            Err(ParseError::InvalidField {
                field: "de_rec_len",
                reason: "rec_len chain ends short of block boundary"
            })
        ));
    }

    #[test]
    fn dir_iter_decodes_full_64k_record() {
        let mut block = vec![0_u8; 1 << 16];
        put_u32(&mut block, 0, 12);
        put_u16(&mut block, 4, u16::MAX);
        block[6] = 4;
        block[7] = 1;
        block[8..12].copy_from_slice(b"only");

        let entries = parse_dir_block(&block).expect("parse");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, b"only");
        assert_eq!(
            lookup_in_dir_block(&block, b"only")
                .expect("scan")
                .map(|e| e.inode_number()),
            Some(InodeNumber(12))
        );
    }

    #[test]
    fn dir_iter_max_rec_len_in_small_block_is_corruption() {
        let mut block = dir_block(&[(5, "a", 1)], BS);
        put_u16(&mut block, 4, u16::MAX);
        assert!(matches!(
            parse_dir_block(&block),
            Err(ParseError::InvalidField {
                reason: "directory entry extends past block boundary",
                ..
            })
        ));
    }

    #[test]
    fn dir_iter_is_restartable() {
        let block = dir_block(&[(5, "a", 1), (6, "b", 1), (7, "c", 1)], BS);
        let mut iter = iter_dir_block(&block);
        let _ = iter.next();
        let saved = iter.clone();
        let rest: Vec<u32> = iter.map(|e| e.expect("entry").inode).collect();
        let again: Vec<u32> = saved.map(|e| e.expect("entry").inode).collect();
        assert_eq!(rest, vec![6, 7]);
        assert_eq!(rest, again);
    }

    #[test]
    fn file_type_from_mode() {
        assert_eq!(Ext2FileType::from_mode(S_IFDIR | 0o700), Ext2FileType::Dir);
        assert_eq!(Ext2FileType::from_mode(S_IFLNK), Ext2FileType::Symlink);
        assert_eq!(Ext2FileType::from_mode(0), Ext2FileType::Unknown);
        assert_eq!(Ext2FileType::from_raw(2), Ext2FileType::Dir);
        assert_eq!(Ext2FileType::from_raw(9), Ext2FileType::Unknown);
    }

    proptest! {
        #[test]
        fn inode_offset_law(start in 0_u64..1_000_000, log in 0_u32..4, n in 1_u32..u32::MAX, size_shift in 7_u32..10) {
            let block_size = BlockSize::from_log(log).unwrap();
            let record_size = 1_u16 << size_shift;
            let table = InodeTable::new(BlockNumber(start), block_size, record_size);
            let expected = start * u64::from(block_size.get())
                + u64::from(n - 1) * u64::from(record_size);
            prop_assert_eq!(inode_offset(&table, InodeNumber(n)), Ok(ByteOffset(expected)));
        }

        #[test]
        fn prefix_and_extension_never_match(name in "[a-z]{1,12}", extra in "[a-z]{1,4}") {
            let longer = format!("{name}{extra}");
            let block = dir_block(&[(5, name.as_str(), 1)], BS);
            prop_assert_eq!(lookup_in_dir_block(&block, name.as_bytes()).unwrap().map(|e| e.inode), Some(5));
            prop_assert!(lookup_in_dir_block(&block, longer.as_bytes()).unwrap().is_none());

            let block = dir_block(&[(6, longer.as_str(), 1)], BS);
            prop_assert!(lookup_in_dir_block(&block, name.as_bytes()).unwrap().is_none());
        }

        #[test]
        fn dir_iter_is_bounded_on_arbitrary_bytes(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut consumed = 0_usize;
            let mut iter = iter_dir_block(&bytes);
            loop {
                let Some(item) = iter.next() else { break };
                consumed += 1;
                prop_assert!(iter.offset() <= bytes.len());
                if item.is_err() {
                    break;
                }
            }
            prop_assert!(consumed <= bytes.len() / 8 + 1);
        }
    }
}
