/*!
 * Data model: FileRecord, BlockInfo, flags, and version vectors.
 *
 * These are the immutable snapshots the index hands to the core (spec §3).
 * The core never constructs a `FileRecord` for a file it has scanned itself
 * — that is the scanner's job, out of scope here — it only consumes what
 * `Index::with_need` / `Index::current_*_file` return.
 */

use serde::{Deserialize, Serialize};

/// A content-addressed block, re-exported from the splitter crate so the
/// rest of the engine has exactly one block type.
pub type BlockInfo = cdc_splitter::Block;

/// POSIX mode bits occupy the low 9 bits of [`Flags`].
const MODE_MASK: u32 = 0o777;
const FLAG_DIRECTORY: u32 = 1 << 12;
const FLAG_SYMLINK: u32 = 1 << 13;
const FLAG_DELETED: u32 = 1 << 14;
const FLAG_INVALID: u32 = 1 << 15;

/// Bitfield holding POSIX mode bits plus type/state flags (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags(pub u32);

impl Flags {
    pub fn new(mode: u32) -> Self {
        Self(mode & MODE_MASK)
    }

    pub fn mode(self) -> u32 {
        self.0 & MODE_MASK
    }

    pub fn is_directory(self) -> bool {
        self.0 & FLAG_DIRECTORY != 0
    }

    pub fn is_symlink(self) -> bool {
        self.0 & FLAG_SYMLINK != 0
    }

    pub fn is_deleted(self) -> bool {
        self.0 & FLAG_DELETED != 0
    }

    pub fn is_invalid(self) -> bool {
        self.0 & FLAG_INVALID != 0
    }

    pub fn with_directory(mut self, v: bool) -> Self {
        self.set(FLAG_DIRECTORY, v);
        self
    }

    pub fn with_symlink(mut self, v: bool) -> Self {
        self.set(FLAG_SYMLINK, v);
        self
    }

    pub fn with_deleted(mut self, v: bool) -> Self {
        self.set(FLAG_DELETED, v);
        self
    }

    pub fn with_invalid(mut self, v: bool) -> Self {
        self.set(FLAG_INVALID, v);
        self
    }

    fn set(&mut self, bit: u32, v: bool) {
        if v {
            self.0 |= bit;
        } else {
            self.0 &= !bit;
        }
    }
}

/// Opaque, per-file monotonic version vector. The core never compares two
/// versions itself; the index does. It is carried through purely so that
/// `update_local` can hand it back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Version(pub Vec<(u64, u64)>);

/// Immutable snapshot of one file as known to the index (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Path relative to the folder root; forward slashes, no leading slash,
    /// never empty.
    pub name: String,
    pub flags: Flags,
    /// Unix seconds.
    pub modified: i64,
    pub version: Version,
    /// Empty for directories, deletions, and symlinks.
    pub blocks: Vec<BlockInfo>,
}

impl FileRecord {
    pub fn is_deleted(&self) -> bool {
        self.flags.is_deleted()
    }

    pub fn is_directory(&self) -> bool {
        self.flags.is_directory()
    }

    pub fn is_symlink(&self) -> bool {
        self.flags.is_symlink()
    }

    /// The content hash of the file's first block, used as the rename
    /// detection bucket key (spec §3, "Buckets").
    pub fn first_block_hash(&self) -> Option<[u8; 32]> {
        self.blocks.first().map(|b| b.hash)
    }

    /// Validates the invariants on the block sequence (spec §3):
    /// `blocks[0].offset == 0`; consecutive blocks tile without gaps or
    /// overlaps.
    pub fn blocks_are_well_formed(&self) -> bool {
        let mut expected_offset = 0u64;
        for b in &self.blocks {
            if b.offset != expected_offset || b.size == 0 {
                return false;
            }
            expected_offset += b.size as u64;
        }
        true
    }
}

/// Byte-equality of two block lists: same count, same (offset, size, hash)
/// per block. Used by the shortcut path and rename detection (spec §4.8).
pub fn blocks_equal(a: &[BlockInfo], b: &[BlockInfo]) -> bool {
    a.len() == b.len()
        && a.iter()
            .zip(b.iter())
            .all(|(x, y)| x.offset == y.offset && x.size == y.size && x.hash == y.hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(offset: u64, size: u32, tag: u8) -> BlockInfo {
        BlockInfo {
            offset,
            size,
            hash: [tag; 32],
        }
    }

    #[test]
    fn flags_round_trip_mode_and_bits() {
        let f = Flags::new(0o644)
            .with_directory(true)
            .with_symlink(false)
            .with_deleted(true);
        assert_eq!(f.mode(), 0o644);
        assert!(f.is_directory());
        assert!(!f.is_symlink());
        assert!(f.is_deleted());
        assert!(!f.is_invalid());
    }

    #[test]
    fn well_formed_blocks_tile_without_gaps() {
        let rec = FileRecord {
            name: "a".into(),
            flags: Flags::new(0o644),
            modified: 0,
            version: Version::default(),
            blocks: vec![block(0, 10, 1), block(10, 5, 2)],
        };
        assert!(rec.blocks_are_well_formed());
    }

    #[test]
    fn gap_in_blocks_is_not_well_formed() {
        let rec = FileRecord {
            name: "a".into(),
            flags: Flags::new(0o644),
            modified: 0,
            version: Version::default(),
            blocks: vec![block(0, 10, 1), block(20, 5, 2)],
        };
        assert!(!rec.blocks_are_well_formed());
    }

    #[test]
    fn blocks_equal_checks_byte_equality() {
        let a = vec![block(0, 10, 1), block(10, 5, 2)];
        let b = vec![block(0, 10, 1), block(10, 5, 2)];
        let c = vec![block(0, 10, 1), block(10, 5, 9)];
        assert!(blocks_equal(&a, &b));
        assert!(!blocks_equal(&a, &c));
    }
}
