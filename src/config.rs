use std::path::PathBuf;

use crate::dedup;

pub const DEFAULT_TESTING_PREFIX: &str = "testes-------";
pub const DEFAULT_SINK_CAPACITY: usize = 100_000;
pub const SEGMENT_FILE: &str = "tracks.db";

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory holding the segment file.
    pub data_dir: PathBuf,
    /// Prefix every stored name with `testing_prefix`.
    pub testing: bool,
    pub testing_prefix: String,
    pub dedup_capacity: usize,
    /// Fixed archive file appended to by every batch.
    pub master_archive: Option<PathBuf>,
    /// Path prefix of the per-batch archive files.
    pub edge_archive: Option<PathBuf>,
    /// Bound of each sink channel.
    pub sink_capacity: usize,
    /// fsync after every append.
    pub strict_durability: bool,
}

impl Config {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn segment_path(&self) -> PathBuf {
        self.data_dir.join(SEGMENT_FILE)
    }

    pub fn with_testing(mut self, testing: bool) -> Self {
        self.testing = testing;
        self
    }

    pub fn with_archives(mut self, master: Option<PathBuf>, edge: Option<PathBuf>) -> Self {
        self.master_archive = master;
        self.edge_archive = edge;
        self
    }

    pub fn with_dedup_capacity(mut self, capacity: usize) -> Self {
        self.dedup_capacity = capacity;
        self
    }

    pub fn with_strict_durability(mut self, strict: bool) -> Self {
        self.strict_durability = strict;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            testing: false,
            testing_prefix: DEFAULT_TESTING_PREFIX.to_string(),
            dedup_capacity: dedup::DEFAULT_CAPACITY,
            master_archive: None,
            edge_archive: None,
            sink_capacity: DEFAULT_SINK_CAPACITY,
            strict_durability: true,
        }
    }
}
