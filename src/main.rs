use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use trackdb::manager::{self, SystemProfile};
use trackdb::server::TrackServer;
use trackdb::{Config, TrackDb};

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = "Location track store node", long_about = None)]
struct Args {
    #[clap(long, default_value = "127.0.0.1:9000")]
    addr: String,

    #[clap(long, default_value = "data")]
    data_dir: PathBuf,

    /// Store every point under the testing name prefix.
    #[clap(long)]
    testing: bool,

    #[clap(long, default_value = trackdb::config::DEFAULT_TESTING_PREFIX)]
    testing_prefix: String,

    #[clap(long, default_value_t = trackdb::dedup::DEFAULT_CAPACITY)]
    dedup_capacity: usize,

    /// Archive file appended to by every batch.
    #[clap(long)]
    master_archive: Option<PathBuf>,

    /// Path prefix for per-batch archive files.
    #[clap(long)]
    edge_archive: Option<PathBuf>,

    /// Seconds between background compactions, 0 disables.
    #[clap(long, default_value_t = manager::DEFAULT_COMPACTION_INTERVAL.as_secs())]
    compact_interval: u64,
}

fn main() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info,trackdb=info");
    }
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .init();

    let profile = SystemProfile::detect();
    info!(
        cores = profile.logical_cores,
        workers = profile.worker_threads,
        durability = if profile.strict_durability { "strict (fsync)" } else { "high throughput (async)" },
        "resource profile"
    );

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(profile.worker_threads)
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "could not start runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(async_main(Args::parse(), profile)) {
        error!(error = %e, "node stopped");
        std::process::exit(1);
    }
}

async fn async_main(args: Args, profile: SystemProfile) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config {
        data_dir: args.data_dir,
        testing: args.testing,
        testing_prefix: args.testing_prefix,
        dedup_capacity: args.dedup_capacity,
        master_archive: args.master_archive,
        edge_archive: args.edge_archive,
        strict_durability: profile.strict_durability,
        ..Config::default()
    };

    let db = Arc::new(TrackDb::open(config)?);

    if args.compact_interval > 0 {
        manager::start_compaction_thread(db.clone(), Duration::from_secs(args.compact_interval));
    }

    let addr = args.addr.clone();
    let server = TrackServer::new(db.clone());
    let serving = tokio::spawn(async move { server.run(&addr).await });
    info!(addr = %args.addr, "node is ready");

    tokio::select! {
        res = serving => {
            res??;
        }
        res = tokio::signal::ctrl_c() => {
            res?;
            info!("shutting down");
        }
    }

    db.flush_archives();
    Ok(())
}
