#![forbid(unsafe_code)]

use anyhow::{Context, Result, bail, ensure};
use e2c_ondisk::{
    Ext2DirEntry, Ext2GroupDesc, Ext2ImageReader, Ext2Inode, Ext2Superblock, parse_dir_block,
};
use e2c_types::{
    EXT2_DIR_ENTRY_HEADER_LEN, EXT2_GOOD_OLD_INODE_SIZE, EXT2_NAME_LEN, EXT2_NDIR_BLOCKS,
    EXT2_SUPER_MAGIC, EXT2_SUPERBLOCK_OFFSET, InodeNumber, S_IFDIR, S_IFREG,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

// ── Sparse fixtures ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SparseFixture {
    pub size: usize,
    pub writes: Vec<FixtureWrite>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureWrite {
    pub offset: usize,
    pub hex: String,
}

impl SparseFixture {
    /// Describe `image` as its non-zero byte runs.
    #[must_use]
    pub fn from_image(image: &[u8]) -> Self {
        let mut writes = Vec::new();
        let mut i = 0;
        while i < image.len() {
            if image[i] == 0 {
                i += 1;
                continue;
            }
            let start = i;
            while i < image.len() && image[i] != 0 {
                i += 1;
            }
            writes.push(FixtureWrite {
                offset: start,
                hex: hex::encode(&image[start..i]),
            });
        }
        Self {
            size: image.len(),
            writes,
        }
    }

    /// Expand into a zero-filled buffer with every write applied.
    pub fn materialize(&self) -> Result<Vec<u8>> {
        let mut bytes = vec![0_u8; self.size];
        for write in &self.writes {
            let payload = hex::decode(&write.hex)
                .with_context(|| format!("invalid hex at offset {}", write.offset))?;

            let end = write
                .offset
                .checked_add(payload.len())
                .context("fixture offset overflow")?;
            if end > bytes.len() {
                bail!(
                    "fixture write out of bounds: offset={} payload={} size={}",
                    write.offset,
                    payload.len(),
                    bytes.len()
                );
            }

            bytes[write.offset..end].copy_from_slice(&payload);
        }
        Ok(bytes)
    }
}

pub fn load_sparse_fixture(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let fixture: SparseFixture = serde_json::from_str(&text)
        .with_context(|| format!("invalid fixture json {}", path.display()))?;
    fixture.materialize()
}

pub fn validate_superblock_fixture(path: &Path) -> Result<Ext2Superblock> {
    let data = load_sparse_fixture(path)?;
    let sb = Ext2Superblock::parse_superblock_region(&data)
        .with_context(|| format!("failed ext2 parse for fixture {}", path.display()))?;
    sb.validate()
        .with_context(|| format!("invalid ext2 superblock in fixture {}", path.display()))?;
    Ok(sb)
}

pub fn validate_group_desc_fixture(path: &Path) -> Result<Ext2GroupDesc> {
    let data = load_sparse_fixture(path)?;
    Ext2GroupDesc::parse_from_bytes(&data)
        .with_context(|| format!("failed group desc parse for fixture {}", path.display()))
}

pub fn validate_inode_fixture(path: &Path) -> Result<Ext2Inode> {
    let data = load_sparse_fixture(path)?;
    Ext2Inode::parse_from_bytes(&data)
        .with_context(|| format!("failed inode parse for fixture {}", path.display()))
}

pub fn validate_dir_block_fixture(path: &Path) -> Result<Vec<Ext2DirEntry>> {
    let data = load_sparse_fixture(path)?;
    parse_dir_block(&data)
        .with_context(|| format!("failed dir block parse for fixture {}", path.display()))
}

// ── Oracle traversal ────────────────────────────────────────────────────────

/// Reference path walk used to cross-check the resolver.
///
/// Reads inodes through [`Ext2ImageReader`] but walks directory blocks with
/// its own byte loop, so a defect in the directory scanner shows up as a
/// disagreement. Assumes `path` is well formed; empty components are
/// skipped. Returns `Ok(None)` when some component is missing.
pub fn oracle_resolve(image: &[u8], path: &str) -> Result<Option<InodeNumber>> {
    let reader = Ext2ImageReader::new(image).context("oracle: unreadable image")?;
    let mut current = InodeNumber::ROOT;
    for component in path.split('/').filter(|c| !c.is_empty()) {
        let dir = reader
            .read_inode(image, current)
            .with_context(|| format!("oracle: cannot read inode {current}"))?;
        ensure!(dir.is_dir(), "oracle: inode {current} is not a directory");
        let block_no = dir
            .direct_block(0)
            .with_context(|| format!("oracle: inode {current} has no data block"))?;
        let block = reader
            .read_block(image, block_no)
            .with_context(|| format!("oracle: cannot read block {block_no}"))?;
        let entries = oracle_dir_entries(block)
            .with_context(|| format!("oracle: cannot list inode {current}"))?;
        match entries
            .into_iter()
            .find(|(_, name)| name.as_slice() == component.as_bytes())
        {
            Some((ino, _)) => current = InodeNumber(ino),
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

/// Live `(inode, name)` pairs of one directory block.
fn oracle_dir_entries(block: &[u8]) -> Result<Vec<(u32, Vec<u8>)>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < block.len() {
        let header = block
            .get(pos..pos + EXT2_DIR_ENTRY_HEADER_LEN)
            .with_context(|| format!("truncated entry header at {pos}"))?;
        let inode = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let raw_len = u16::from_le_bytes([header[4], header[5]]);
        let name_len = usize::from(header[6]);
        // 65535 stands for a whole 64 KiB block.
        let rec_len = if raw_len == u16::MAX && block.len() >= 1 << 16 {
            1 << 16
        } else {
            usize::from(raw_len)
        };

        ensure!(
            rec_len >= EXT2_DIR_ENTRY_HEADER_LEN,
            "rec_len {rec_len} too small at {pos}"
        );
        let end = pos + rec_len;
        ensure!(end <= block.len(), "record at {pos} overruns the block");
        if inode != 0 {
            ensure!(
                EXT2_DIR_ENTRY_HEADER_LEN + name_len <= rec_len,
                "name overruns record at {pos}"
            );
            let start = pos + EXT2_DIR_ENTRY_HEADER_LEN;
            entries.push((inode, block[start..start + name_len].to_vec()));
        }
        pos = end;
    }
    Ok(entries)
}

// ── Synthetic image builder ─────────────────────────────────────────────────

const FIRST_FREE_INODE: u32 = 11;
const MIN_INODES: u32 = 16;

#[derive(Debug, Clone)]
enum NodeKind {
    Dir(Vec<DirSlot>),
    File(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Node {
    parent: u32,
    kind: NodeKind,
}

#[derive(Debug, Clone)]
struct DirSlot {
    inode: u32,
    name: String,
}

/// Builds small single-group ext2 images in memory.
///
/// The root directory (inode 2) always exists. Directories get exactly one
/// data block holding `.`, `..` and their children in insertion order.
/// Inode numbers are handed out from 11 upwards unless given explicitly.
///
/// ```
/// use e2c_harness::ImageBuilder;
///
/// let mut b = ImageBuilder::new(1024);
/// let etc = b.add_dir_at(2, "etc", 11);
/// b.add_file_at(etc, "motd", 15, b"hello\n");
/// let image = b.build().expect("image");
/// assert_eq!(image.len() % 1024, 0);
/// ```
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    block_size: u32,
    inode_size: Option<u16>,
    volume_name: String,
    nodes: BTreeMap<u32, Node>,
    next_ino: u32,
}

/// Block numbers chosen by [`ImageBuilder::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLayout {
    pub block_size: u32,
    pub group_desc_block: u32,
    pub block_bitmap: u32,
    pub inode_bitmap: u32,
    pub inode_table: u32,
    pub inode_table_blocks: u32,
    pub inodes_count: u32,
    pub blocks_count: u32,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(block_size: u32) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            InodeNumber::ROOT.0,
            Node {
                parent: InodeNumber::ROOT.0,
                kind: NodeKind::Dir(Vec::new()),
            },
        );
        Self {
            block_size,
            inode_size: None,
            volume_name: "e2c".to_owned(),
            nodes,
            next_ino: FIRST_FREE_INODE,
        }
    }

    /// Emit a dynamic-revision superblock with `size`-byte inode records.
    #[must_use]
    pub fn with_inode_size(mut self, size: u16) -> Self {
        self.inode_size = Some(size);
        self
    }

    #[must_use]
    pub fn with_volume_name(mut self, name: &str) -> Self {
        name.clone_into(&mut self.volume_name);
        self
    }

    fn alloc_ino(&mut self) -> u32 {
        while self.nodes.contains_key(&self.next_ino) {
            self.next_ino += 1;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        ino
    }

    fn push_slot(&mut self, parent: u32, name: &str, inode: u32) {
        if let Some(Node {
            kind: NodeKind::Dir(slots),
            ..
        }) = self.nodes.get_mut(&parent)
        {
            slots.push(DirSlot {
                inode,
                name: name.to_owned(),
            });
        }
    }

    fn insert(&mut self, parent: u32, name: &str, ino: u32, kind: NodeKind) -> u32 {
        self.nodes.insert(ino, Node { parent, kind });
        self.push_slot(parent, name, ino);
        ino
    }

    /// Add a subdirectory of `parent`; returns its inode number.
    pub fn add_dir(&mut self, parent: u32, name: &str) -> u32 {
        let ino = self.alloc_ino();
        self.insert(parent, name, ino, NodeKind::Dir(Vec::new()))
    }

    pub fn add_dir_at(&mut self, parent: u32, name: &str, ino: u32) -> u32 {
        self.insert(parent, name, ino, NodeKind::Dir(Vec::new()))
    }

    /// Add a regular file of `parent`; returns its inode number.
    pub fn add_file(&mut self, parent: u32, name: &str, contents: &[u8]) -> u32 {
        let ino = self.alloc_ino();
        self.insert(parent, name, ino, NodeKind::File(contents.to_vec()))
    }

    pub fn add_file_at(&mut self, parent: u32, name: &str, ino: u32, contents: &[u8]) -> u32 {
        self.insert(parent, name, ino, NodeKind::File(contents.to_vec()))
    }

    /// Add an entry pointing at `ino` without creating that inode (hard
    /// links, dangling entries).
    pub fn add_link(&mut self, parent: u32, name: &str, ino: u32) {
        self.push_slot(parent, name, ino);
    }

    /// Add a deleted slot (inode 0) that still carries `name`.
    pub fn add_deleted_entry(&mut self, parent: u32, name: &str) {
        self.push_slot(parent, name, 0);
    }

    fn record_size(&self) -> u16 {
        self.inode_size.unwrap_or(EXT2_GOOD_OLD_INODE_SIZE)
    }

    fn data_blocks_for(&self, node: &Node) -> Result<u32> {
        match &node.kind {
            NodeKind::Dir(_) => Ok(1),
            NodeKind::File(contents) => {
                let blocks = u32::try_from(contents.len().div_ceil(self.block_size as usize))?;
                ensure!(
                    blocks as usize <= EXT2_NDIR_BLOCKS,
                    "file of {} bytes needs indirect blocks",
                    contents.len()
                );
                Ok(blocks)
            }
        }
    }

    /// Compute where every metadata structure lands.
    pub fn layout(&self) -> Result<ImageLayout> {
        ensure!(
            self.block_size.is_power_of_two() && (1024..=65536).contains(&self.block_size),
            "unsupported block size {}",
            self.block_size
        );
        let record = u32::from(self.record_size());
        ensure!(
            record >= 128 && record.is_power_of_two() && record <= self.block_size,
            "unsupported inode size {record}"
        );

        let max_ino = self.nodes.keys().copied().max().unwrap_or(0).max(MIN_INODES);
        let per_block = self.block_size / record;
        let inode_table_blocks = max_ino.div_ceil(per_block);
        let group_desc_block = (EXT2_SUPERBLOCK_OFFSET as u32) / self.block_size + 1;
        let inode_table = group_desc_block + 3;

        let mut data_blocks = 0;
        for node in self.nodes.values() {
            data_blocks += self.data_blocks_for(node)?;
        }

        Ok(ImageLayout {
            block_size: self.block_size,
            group_desc_block,
            block_bitmap: group_desc_block + 1,
            inode_bitmap: group_desc_block + 2,
            inode_table,
            inode_table_blocks,
            inodes_count: inode_table_blocks * per_block,
            blocks_count: inode_table + inode_table_blocks + data_blocks,
        })
    }

    fn file_type_of(&self, ino: u32) -> u8 {
        match self.nodes.get(&ino).map(|n| &n.kind) {
            Some(NodeKind::Dir(_)) => 2,
            Some(NodeKind::File(_)) => 1,
            None => 0,
        }
    }

    /// Serialize the tree into an image buffer.
    pub fn build(&self) -> Result<Vec<u8>> {
        let layout = self.layout()?;
        let bs = layout.block_size as usize;
        let mut image = vec![0_u8; layout.blocks_count as usize * bs];

        self.write_superblock(&mut image, &layout);

        let gd = layout.group_desc_block as usize * bs;
        let used_dirs = self
            .nodes
            .values()
            .filter(|n| matches!(n.kind, NodeKind::Dir(_)))
            .count();
        put_u32(&mut image, gd, layout.block_bitmap);
        put_u32(&mut image, gd + 0x04, layout.inode_bitmap);
        put_u32(&mut image, gd + 0x08, layout.inode_table);
        put_u16(&mut image, gd + 0x10, u16::try_from(used_dirs)?);

        let mut next_block = layout.inode_table + layout.inode_table_blocks;
        for (&ino, node) in &self.nodes {
            let nblocks = self.data_blocks_for(node)?;
            let first = next_block;
            next_block += nblocks;

            let (mode, size, links) = match &node.kind {
                NodeKind::Dir(slots) => {
                    let block = self
                        .dir_block(ino, node.parent, slots)
                        .with_context(|| format!("directory inode {ino}"))?;
                    let at = first as usize * bs;
                    image[at..at + bs].copy_from_slice(&block);
                    (S_IFDIR | 0o755, bs as u64, 2)
                }
                NodeKind::File(contents) => {
                    let at = first as usize * bs;
                    image[at..at + contents.len()].copy_from_slice(contents);
                    (S_IFREG | 0o644, contents.len() as u64, 1)
                }
            };

            let off = (layout.inode_table as usize) * bs
                + (ino as usize - 1) * usize::from(self.record_size());
            put_u16(&mut image, off, mode);
            put_u32(&mut image, off + 0x04, (size & 0xFFFF_FFFF) as u32);
            put_u16(&mut image, off + 0x1A, links);
            put_u32(&mut image, off + 0x1C, nblocks * (layout.block_size / 512));
            for i in 0..nblocks {
                put_u32(&mut image, off + 0x28 + i as usize * 4, first + i);
            }
            if mode & S_IFREG == S_IFREG {
                put_u32(&mut image, off + 0x6C, (size >> 32) as u32);
            }
        }

        Ok(image)
    }

    fn write_superblock(&self, image: &mut [u8], layout: &ImageLayout) {
        let sb = EXT2_SUPERBLOCK_OFFSET;
        put_u32(image, sb, layout.inodes_count);
        put_u32(image, sb + 0x04, layout.blocks_count);
        put_u32(image, sb + 0x14, u32::from(layout.block_size == 1024));
        put_u32(image, sb + 0x18, layout.block_size.trailing_zeros() - 10);
        put_u32(image, sb + 0x20, layout.block_size * 8);
        put_u32(image, sb + 0x28, layout.inodes_count);
        put_u16(image, sb + 0x38, EXT2_SUPER_MAGIC);
        put_u16(image, sb + 0x3A, 1);
        if let Some(size) = self.inode_size {
            put_u32(image, sb + 0x4C, 1);
            put_u32(image, sb + 0x54, FIRST_FREE_INODE);
            put_u16(image, sb + 0x58, size);
        }
        let name = self.volume_name.as_bytes();
        let n = name.len().min(16);
        image[sb + 0x78..sb + 0x78 + n].copy_from_slice(&name[..n]);
    }

    fn dir_block(&self, ino: u32, parent: u32, slots: &[DirSlot]) -> Result<Vec<u8>> {
        let bs = self.block_size as usize;
        let mut records: Vec<(u32, &str, u8)> = vec![(ino, ".", 2), (parent, "..", 2)];
        for slot in slots {
            ensure!(
                !slot.name.is_empty() && slot.name.len() <= EXT2_NAME_LEN,
                "bad entry name {:?}",
                slot.name
            );
            records.push((slot.inode, slot.name.as_str(), self.file_type_of(slot.inode)));
        }

        let mut block = vec![0_u8; bs];
        let mut offset = 0;
        for (i, (inode, name, file_type)) in records.iter().enumerate() {
            let min = (EXT2_DIR_ENTRY_HEADER_LEN + name.len() + 3) & !3;
            let rec_len = if i + 1 == records.len() {
                bs - offset
            } else {
                min
            };
            ensure!(
                offset + min <= bs && rec_len >= min,
                "directory entries overflow one block"
            );
            put_u32(&mut block, offset, *inode);
            put_u16(&mut block, offset + 4, u16::try_from(rec_len)?);
            block[offset + 6] = u8::try_from(name.len())?;
            block[offset + 7] = *file_type;
            block[offset + 8..offset + 8 + name.len()].copy_from_slice(name.as_bytes());
            offset += rec_len;
        }
        Ok(block)
    }
}

fn put_u16(buf: &mut [u8], off: usize, v: u16) {
    buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

/// The `/etc/motd` tree: root → `etc` (11) → `motd` (15).
pub fn etc_motd_image(block_size: u32) -> Result<Vec<u8>> {
    let mut b = ImageBuilder::new(block_size);
    let etc = b.add_dir_at(2, "etc", 11);
    b.add_file_at(etc, "motd", 15, b"Welcome to e2c\n");
    b.build()
}
