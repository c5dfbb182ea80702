use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::TrackDb;

pub const DEFAULT_COMPACTION_INTERVAL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct SystemProfile {
    pub logical_cores: usize,
    pub worker_threads: usize,
    pub strict_durability: bool, // true = fsync per append, false = OS buffer
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::for_cores(cores)
    }

    pub fn for_cores(cores: usize) -> Self {
        if cores <= 1 {
            warn!(cores, "single core detected, disabling fsync per append");
            Self {
                logical_cores: cores,
                worker_threads: 2, // 1 compute + 1 I/O
                strict_durability: false,
            }
        } else {
            Self {
                logical_cores: cores,
                worker_threads: cores,
                strict_durability: true,
            }
        }
    }
}

/// Runs segment compaction on `db` every `interval` for the life of the process.
pub fn start_compaction_thread(db: Arc<TrackDb>, interval: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        info!(interval_secs = interval.as_secs(), "background compaction thread started");
        loop {
            thread::sleep(interval);
            if let Err(e) = db.compact() {
                error!(error = %e, "compaction failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles() {
        let potato = SystemProfile::for_cores(1);
        assert_eq!(potato.worker_threads, 2);
        assert!(!potato.strict_durability);

        let server = SystemProfile::for_cores(16);
        assert_eq!(server.worker_threads, 16);
        assert!(server.strict_durability);
    }
}
