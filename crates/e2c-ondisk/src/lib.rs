#![forbid(unsafe_code)]
//! On-disk format parsing for ext2 structures.
//!
//! Pure parsing crate: no I/O, no side effects. Interprets a borrowed image
//! buffer as an ext2 superblock, block group descriptor, inode table and
//! single-block directories.

pub mod ext2;

pub use ext2::{
    ASSUMED_BLOCK_GROUPS, DirBlockIter, EXT2_GROUP_DESC_SIZE, Ext2DirEntry, Ext2DirEntryRef,
    Ext2FileType, Ext2GroupDesc, Ext2ImageReader, Ext2Inode, Ext2Superblock, InodeTable,
    ROOT_INODE_NUM, block_offset, directory_block, find_entry, find_entry_with,
    group_desc_table_block, inode_offset, iter_dir_block, list_entries, lookup_in_dir_block,
    lookup_in_dir_block_with, parse_dir_block, read_block, read_block_group, read_group_desc,
    read_inode, read_superblock, root_inode,
};
