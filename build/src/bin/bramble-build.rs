use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bramble_build::{graph::derivation_map, BuildRequest, FailurePolicy, WalkOptions};
use bramble_store::cache::LocalCache;
use bramble_store::fetch::HttpFetcher;
use bramble_store::lockfile::FileLockfile;
use bramble_store::{sandbox, BuildOptions, Builder, Store, StoreConfig};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// A global log level to use when printing logs.
    /// It's also possible to set `RUST_LOG` according to
    /// `tracing_subscriber::filter::EnvFilter`, which will always have
    /// priority.
    #[arg(long, default_value_t = Level::INFO)]
    log_level: Level,

    #[command(flatten)]
    store: StoreConfig,

    /// JSON file with the derivations to build and the outputs requested.
    request: PathBuf,

    /// Number of derivations built at once, 0 for no limit.
    #[arg(long, env = "BRAMBLE_MAX_PARALLEL", default_value_t = 8)]
    max_parallel: usize,

    #[arg(long, value_enum, default_value_t = FailurePolicy::FailFast)]
    failure_policy: FailurePolicy,

    /// Rebuild derivations that were built before, and fail if their
    /// outputs changed.
    #[arg(long)]
    check: bool,

    /// Build even if a built copy exists.
    #[arg(long)]
    force: bool,

    /// Show builder output instead of capturing it.
    #[arg(long, short = 'v')]
    verbose: bool,

    /// Print the dependency graph in graphviz format and exit.
    #[arg(long)]
    dot: bool,

    /// Lockfile pinning fetched hashes. Defaults to `bramble.lock.json`
    /// next to the request.
    #[arg(long, env = "BRAMBLE_LOCKFILE")]
    lockfile: Option<PathBuf>,

    #[arg(long, env, default_value = "process://")]
    sandbox_addr: String,

    /// Directory used as a local binary cache.
    #[arg(long, env = "BRAMBLE_CACHE_DIR")]
    cache_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let tracing_handle = bramble_tracing::TracingBuilder::default()
        .level(cli.log_level)
        .enable_progressbar()
        .build()?;

    let request = BuildRequest::load(&cli.request)
        .await
        .with_context(|| format!("loading {}", cli.request.display()))?;

    if cli.dot {
        let requested = request.requested_outputs();
        let derivations = derivation_map(request.derivations);
        let names = derivations
            .iter()
            .map(|(hash, drv)| (hash.clone(), drv.name.clone()))
            .collect();
        let graph = bramble_build::graph::build_graph(&requested, &derivations)?;
        writeln!(tracing_handle.get_stdout_writer(), "{}", graph.to_dot(&names))?;
        return Ok(());
    }

    let store = Arc::new(Store::new(&cli.store)?);
    let project = std::path::absolute(&cli.request)?
        .parent()
        .map(PathBuf::from)
        .context("request has no parent directory")?;
    let lockfile = cli
        .lockfile
        .clone()
        .unwrap_or_else(|| project.join("bramble.lock.json"));

    let mut builder = Builder::new(
        store.clone(),
        Arc::from(sandbox::from_addr(&cli.sandbox_addr)?),
        Arc::new(HttpFetcher::default()),
        Arc::new(FileLockfile::open(lockfile)?),
    );
    if let Some(dir) = &cli.cache_dir {
        builder = builder.with_cache(Arc::new(LocalCache::new(dir)?));
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping builds");
                cancel.cancel();
            }
        }
    });

    let walk = WalkOptions {
        max_parallel: cli.max_parallel,
        failure_policy: cli.failure_policy,
        check: cli.check,
    };
    let opts = BuildOptions {
        force_build: cli.force,
        verbose: cli.verbose,
    };
    let result = bramble_build::build(Arc::new(builder), request, &walk, &opts, &cancel).await?;

    let mut stdout = tracing_handle.get_stdout_writer();
    for dep in &result.requested {
        if let Some(path) = result.output_path(dep) {
            writeln!(stdout, "{}", store.join(path).display())?;
        }
    }

    store.write_config_link(&project).await?;
    info!(requested = result.requested.len(), "done");
    Ok(())
}
