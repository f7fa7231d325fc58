/*!
 * Configuration structures and defaults for the folder sync engine
 */

use std::time::Duration;

/// Timer defaults, spec §6.
pub const PAUSE_INTV: Duration = Duration::from_secs(60);
pub const NEXT_PULL_INTV: Duration = Duration::from_secs(10);
pub const CHECK_PULL_INTV: Duration = Duration::from_secs(1);

/// How verbosely the engine preserves POSIX permission bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunables {
    /// Worker count for the copier pool. Must be >= 1.
    pub copiers: usize,
    /// Worker count for the puller pool. Must be >= 1.
    pub pullers: usize,
    /// Periodic rescan interval; `Duration::ZERO` disables periodic rescans.
    pub scan_intv: Duration,
    /// If true, `chmod` is skipped on commit.
    pub ignore_perms: bool,
    /// If true, an mtime-preservation failure is a warning, not an abort.
    pub lenient_mtimes: bool,
    /// Fixed block size for scans that do not use the rolling splitter.
    pub block_size: u32,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            copiers: 1,
            pullers: 4,
            scan_intv: Duration::from_secs(60),
            ignore_perms: false,
            lenient_mtimes: false,
            block_size: 128 * 1024,
        }
    }
}

impl Tunables {
    pub fn with_copiers(mut self, n: usize) -> Self {
        self.copiers = n.max(1);
        self
    }

    pub fn with_pullers(mut self, n: usize) -> Self {
        self.pullers = n.max(1);
        self
    }

    pub fn with_scan_interval(mut self, d: Duration) -> Self {
        self.scan_intv = d;
        self
    }

    pub fn with_ignore_perms(mut self, ignore: bool) -> Self {
        self.ignore_perms = ignore;
        self
    }

    pub fn with_lenient_mtimes(mut self, lenient: bool) -> Self {
        self.lenient_mtimes = lenient;
        self
    }

    pub fn with_block_size(mut self, size: u32) -> Self {
        self.block_size = size;
        self
    }
}

/// Per-folder configuration consumed by the iteration driver and serve loop.
#[derive(Debug, Clone)]
pub struct FolderConfig {
    pub folder_id: String,
    pub root: std::path::PathBuf,
    pub tunables: Tunables,
}

impl FolderConfig {
    pub fn new(folder_id: impl Into<String>, root: impl Into<std::path::PathBuf>) -> Self {
        Self {
            folder_id: folder_id.into(),
            root: root.into(),
            tunables: Tunables::default(),
        }
    }

    pub fn with_tunables(mut self, tunables: Tunables) -> Self {
        self.tunables = tunables;
        self
    }
}
