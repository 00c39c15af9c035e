#![forbid(unsafe_code)]
//! Path resolution over a read-only ext2 image.
//!
//! [`PathResolver`] parses the superblock and group descriptor once and then
//! walks directories one component at a time: read the directory inode,
//! scan its first data block for the next name, descend. The first missing
//! component ends the walk with [`E2cError::NotFound`].

mod path;

pub use e2c_error::{E2cError, Result};
pub use e2c_ondisk::{ASSUMED_BLOCK_GROUPS, Ext2DirEntry, Ext2ImageReader, Ext2Inode};
pub use e2c_types::InodeNumber;
pub use path::Ext2Path;

use e2c_ondisk::find_entry_with;
use e2c_types::ParseError;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

// ── Options ─────────────────────────────────────────────────────────────────

/// Options controlling path resolution.
///
/// Deserializes from partial documents; missing fields take their defaults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolveOptions {
    /// Reject paths with more components than this before touching the
    /// image. `None` means unbounded.
    pub max_depth: Option<usize>,
    /// Validate superblock magic and inode size before the first lookup.
    pub verify_magic: bool,
}

// ── Error conversion ────────────────────────────────────────────────────────

/// Convert an on-disk `ParseError` into the caller-facing `E2cError`.
#[must_use]
pub fn parse_to_e2c_error(e: &ParseError) -> E2cError {
    match e {
        ParseError::InsufficientData {
            needed,
            offset,
            actual,
        } => E2cError::OutOfBounds {
            offset: *offset,
            needed: *needed,
            available: *actual,
        },
        ParseError::InvalidMagic { .. }
        | ParseError::InvalidField { .. }
        | ParseError::IntegerConversion { .. } => E2cError::InvalidFilesystem(e.to_string()),
        ParseError::InvalidArgument { .. } => E2cError::InvalidArgument(e.to_string()),
    }
}

fn map_parse(e: ParseError) -> E2cError {
    parse_to_e2c_error(&e)
}

// ── Resolver ────────────────────────────────────────────────────────────────

/// Resolves paths against one borrowed image.
///
/// Holds the parsed superblock, block size and inode table location so
/// repeated resolutions skip that work.
#[derive(Debug, Clone)]
pub struct PathResolver<'a> {
    image: &'a [u8],
    reader: Ext2ImageReader,
    options: ResolveOptions,
}

impl<'a> PathResolver<'a> {
    pub fn new(image: &'a [u8]) -> Result<Self> {
        Self::with_options(image, ResolveOptions::default())
    }

    pub fn with_options(image: &'a [u8], options: ResolveOptions) -> Result<Self> {
        let reader = Ext2ImageReader::new(image).map_err(map_parse)?;
        if options.verify_magic {
            reader.sb.validate().map_err(map_parse)?;
        }

        let groups = reader.sb.group_count();
        if groups > ASSUMED_BLOCK_GROUPS {
            warn!(
                target: "e2c::resolve",
                groups,
                assumed = ASSUMED_BLOCK_GROUPS,
                "multi_group_image"
            );
        }

        Ok(Self {
            image,
            reader,
            options,
        })
    }

    #[must_use]
    pub fn reader(&self) -> &Ext2ImageReader {
        &self.reader
    }

    #[must_use]
    pub fn options(&self) -> ResolveOptions {
        self.options
    }

    pub fn read_inode(&self, ino: InodeNumber) -> Result<Ext2Inode> {
        self.reader.read_inode(self.image, ino).map_err(map_parse)
    }

    /// Look `name` up in directory `dir`.
    ///
    /// `Ok(None)` means the directory is well formed and has no such entry.
    /// Names match on exact length and then exact bytes.
    pub fn find_entry(&self, dir: &Ext2Inode, name: &str) -> Result<Option<InodeNumber>> {
        find_entry_with(self.image, self.reader.block_size, dir, name.as_bytes(), |entry| {
            trace!(
                target: "e2c::resolve",
                entry_inode = entry.inode,
                rec_len = entry.rec_len,
                name = %String::from_utf8_lossy(entry.name),
                "dir_entry"
            );
        })
        .map_err(|e| {
            warn!(
                target: "e2c::resolve",
                component = name,
                error = %e,
                "corrupt_directory"
            );
            map_parse(e)
        })
    }

    /// Walk `path` and return the final inode number.
    ///
    /// The root path returns inode 2 without reading anything.
    pub fn resolve_parsed(&self, path: &Ext2Path) -> Result<InodeNumber> {
        if let Some(limit) = self.options.max_depth {
            if path.depth() > limit {
                return Err(E2cError::DepthExceeded {
                    depth: path.depth(),
                    limit,
                });
            }
        }

        debug!(target: "e2c::resolve", path = %path, depth = path.depth(), "resolve_start");

        let mut current = InodeNumber::ROOT;
        for (level, component) in path.components().iter().enumerate() {
            trace!(
                target: "e2c::resolve",
                level,
                component = component.as_str(),
                dir = current.0,
                "resolve_component"
            );
            let dir = self.read_inode(current)?;
            match self.find_entry(&dir, component)? {
                Some(next) => current = next,
                None => {
                    debug!(
                        target: "e2c::resolve",
                        path = %path,
                        missing = component.as_str(),
                        level,
                        "resolve_not_found"
                    );
                    return Err(E2cError::NotFound(path.to_string()));
                }
            }
        }

        debug!(target: "e2c::resolve", path = %path, inode = current.0, "resolve_done");
        Ok(current)
    }

    /// Resolve a path string to an inode number.
    pub fn resolve(&self, path: &str) -> Result<InodeNumber> {
        self.resolve_parsed(&Ext2Path::parse(path)?)
    }

    /// Resolve a path string and read the inode it names.
    pub fn resolve_inode(&self, path: &str) -> Result<(InodeNumber, Ext2Inode)> {
        let ino = self.resolve(path)?;
        Ok((ino, self.read_inode(ino)?))
    }

    /// List the live entries of the directory at `path` (first block only).
    pub fn list_dir(&self, path: &str) -> Result<Vec<Ext2DirEntry>> {
        let (_, dir) = self.resolve_inode(path)?;
        self.reader
            .list_entries(self.image, &dir)
            .map_err(map_parse)
    }
}

// ── One-shot entry points ───────────────────────────────────────────────────

/// Resolve `path` in `image` with default options.
pub fn resolve(image: &[u8], path: &str) -> Result<InodeNumber> {
    PathResolver::new(image)?.resolve(path)
}

pub fn resolve_with(image: &[u8], path: &str, options: ResolveOptions) -> Result<InodeNumber> {
    PathResolver::with_options(image, options)?.resolve(path)
}

/// Like [`resolve`], but a missing file is `Ok(None)` rather than an error.
///
/// This is the lookup a `cat`-style front end performs before reading data.
pub fn resolve_path(image: &[u8], path: &str) -> Result<Option<InodeNumber>> {
    match resolve(image, path) {
        Ok(ino) => Ok(Some(ino)),
        Err(E2cError::NotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn resolve_inode(image: &[u8], path: &str) -> Result<(InodeNumber, Ext2Inode)> {
    PathResolver::new(image)?.resolve_inode(path)
}

pub fn list_dir(image: &[u8], path: &str) -> Result<Vec<Ext2DirEntry>> {
    PathResolver::new(image)?.list_dir(path)
}
