use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use chrono::Utc;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::model::{time_nanos, TrackFeature};

/// Background writers mirroring stored features to gzip-compressed,
/// newline-delimited GeoJSON archives.
///
/// The master archive is one file appended to by every batch, one batch at a
/// time, each batch as its own gzip member. The edge archive gets one file per batch, named
/// `<prefix>-wip-<nanos>` while written and renamed to `<prefix>-fin-<nanos>`
/// once its channel is drained.
pub struct ArchiveSinks {
    master: Option<PathBuf>,
    edge: Option<PathBuf>,
    capacity: usize,
    master_lock: Arc<Mutex<()>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Producer side of one batch's sinks. Dropping it closes the channels.
pub struct BatchSinks {
    senders: Vec<SyncSender<TrackFeature>>,
}

impl BatchSinks {
    pub fn send(&self, feature: &TrackFeature) {
        for tx in &self.senders {
            if tx.send(feature.clone()).is_err() {
                debug!("archive worker gone, feature not mirrored");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.senders.is_empty()
    }
}

impl ArchiveSinks {
    pub fn new(config: &Config) -> Self {
        Self {
            master: config.master_archive.clone(),
            edge: config.edge_archive.clone(),
            capacity: config.sink_capacity.max(1),
            master_lock: Arc::new(Mutex::new(())),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.master.is_some() || self.edge.is_some()
    }

    /// Starts the workers for one batch.
    pub fn open_batch(&self) -> BatchSinks {
        let mut senders = Vec::new();
        let mut spawned = Vec::new();

        if let Some(path) = &self.master {
            let (tx, rx) = sync_channel(self.capacity);
            let path = path.clone();
            let lock = self.master_lock.clone();
            spawned.push(thread::spawn(move || drain_master(&path, &lock, rx)));
            senders.push(tx);
        }

        if let Some(prefix) = &self.edge {
            let wip = suffixed(prefix, "wip");
            match File::create(&wip) {
                Ok(file) => {
                    let (tx, rx) = sync_channel(self.capacity);
                    let prefix = prefix.clone();
                    spawned.push(thread::spawn(move || drain_edge(file, wip, &prefix, rx)));
                    senders.push(tx);
                }
                Err(e) => error!(path = %wip.display(), error = %e, "could not create edge archive"),
            }
        }

        if let Ok(mut workers) = self.workers.lock() {
            workers.retain(|h| !h.is_finished());
            workers.extend(spawned);
        }
        BatchSinks { senders }
    }

    /// Blocks until every worker started so far has finished.
    pub fn wait_idle(&self) {
        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut workers) => workers.drain(..).collect(),
            Err(_) => return,
        };
        for h in handles {
            if h.join().is_err() {
                warn!("archive worker panicked");
            }
        }
    }
}

fn suffixed(prefix: &Path, stage: &str) -> PathBuf {
    let nanos = time_nanos(&Utc::now());
    PathBuf::from(format!("{}-{}-{}", prefix.display(), stage, nanos))
}

/// Writes one gzip member holding every feature received, at best compression.
fn write_all(file: File, rx: Receiver<TrackFeature>) -> std::io::Result<usize> {
    let mut gz = GzEncoder::new(BufWriter::new(file), Compression::best());
    let mut n = 0;
    for feature in rx {
        serde_json::to_writer(&mut gz, &feature)?;
        gz.write_all(b"\n")?;
        n += 1;
    }
    let mut out = gz.finish()?;
    out.flush()?;
    Ok(n)
}

fn drain_master(path: &Path, lock: &Mutex<()>, rx: Receiver<TrackFeature>) {
    let Ok(_guard) = lock.lock() else {
        error!("master archive lock poisoned");
        return;
    };
    let file = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(f) => f,
        Err(e) => {
            error!(path = %path.display(), error = %e, "could not open master archive");
            return;
        }
    };
    match write_all(file, rx) {
        Ok(n) => debug!(path = %path.display(), features = n, "master archive appended"),
        Err(e) => error!(path = %path.display(), error = %e, "master archive write failed"),
    }
}

fn drain_edge(file: File, wip: PathBuf, prefix: &Path, rx: Receiver<TrackFeature>) {
    let written = write_all(file, rx);
    if let Err(e) = written {
        error!(path = %wip.display(), error = %e, "edge archive write failed");
        return;
    }
    let fin = suffixed(prefix, "fin");
    match fs::rename(&wip, &fin) {
        Ok(()) => info!(path = %fin.display(), "edge archive finalized"),
        Err(e) => error!(path = %wip.display(), error = %e, "could not finalize edge archive"),
    }
}
