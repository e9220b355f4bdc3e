//! sinkhole: ad-blocking DNS proxy
//!
//! Binary entry point. Three subcommands:
//!
//! ```bash
//! # Run the proxy
//! sinkhole serve -c /etc/sinkhole/sinkhole.yml
//!
//! # Build the persistent blacklist database from the configured sources
//! sinkhole init-db -f /var/lib/sinkhole/sinkhole.db
//!
//! # Inspect what a feed parses to
//! sinkhole parse -s https://example.org/hosts.txt
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sinkhole::cache::AnswerCache;
use sinkhole::config::Config;
use sinkhole::error::{Error, Result};
use sinkhole::feed::{open_feed, parse_lines};
use sinkhole::server::{QueryEngine, Server};
use sinkhole::store::{DbDomainStore, DomainStore, MemDomainStore};
use sinkhole::upstream::{Nameserver, PinnedResolver, RacingResolver};

#[derive(Parser)]
#[command(name = "sinkhole")]
#[command(version = sinkhole::VERSION)]
#[command(about = "DNS proxy with ad filter", long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, global = true, default_value = "sinkhole.yml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the DNS proxy server
    Serve,
    /// Initialize the domain blacklist database file
    InitDb {
        /// Path to the database file (defaults to db_file from the config)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
    /// Parse a hosts-format source and print the extracted entries
    Parse {
        /// Source URI, "file:///path/to.txt" or "https://some.where/blacklist.txt"
        #[arg(short, long)]
        source: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(cli).await {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "sinkhole=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(&cli.config)?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::InitDb { file } => init_db(&config, file).await,
        Command::Parse { source } => parse_source(&config, &source).await,
    }
}

/// Build the HTTP client shared by DoH probes and feed downloads.
///
/// Name resolution is pinned to the first plain upstream so the client
/// never loops back through this proxy via the system resolver.
fn build_http_client(config: &Config) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().timeout(config.http_timeout());

    let bootstrap = config
        .nameservers
        .iter()
        .map(|endpoint| Nameserver::parse(endpoint))
        .find_map(|ns| match ns {
            Nameserver::Plain(addr) => Some(addr),
            _ => None,
        });

    match bootstrap {
        Some(addr) => {
            info!(nameserver = %addr, "pinning HTTP client name resolution");
            builder = builder
                .dns_resolver(Arc::new(PinnedResolver::new(addr, config.query_timeout())));
        }
        None => {
            warn!("no plain nameserver configured; HTTP client falls back to the system resolver");
        }
    }

    builder
        .build()
        .map_err(|e| Error::config(format!("failed to build HTTP client: {e}")))
}

/// Feed every configured source into the store. One bad source is logged
/// and skipped; the others proceed.
async fn ingest_sources(
    store: &dyn DomainStore,
    sources: &[String],
    http: &reqwest::Client,
) -> usize {
    info!("initializing blacklist, this may take a while");

    let mut total = 0;
    for uri in sources {
        info!(source = %uri, "processing");
        let reader = match open_feed(uri, http).await {
            Ok(reader) => reader,
            Err(e) => {
                error!(source = %uri, error = %e, "feed download failed");
                continue;
            }
        };
        match store.update(reader).await {
            Ok(count) => {
                info!(source = %uri, count, "feed ingested");
                total += count;
            }
            Err(e) => error!(source = %uri, error = %e, "feed ingestion failed"),
        }
    }

    info!(total, sources = sources.len(), "blacklist initialized");
    total
}

async fn serve(config: Config) -> Result<()> {
    let http = build_http_client(&config)?;

    let whitelist: Arc<dyn DomainStore> =
        Arc::new(MemDomainStore::with_entries(&config.whitelist_domains)?);

    let blacklist: Arc<dyn DomainStore> = if config.db_file.is_empty() {
        info!("starting DNS proxy with ad filter (in-memory backend)");
        let store = Arc::new(MemDomainStore::new());
        ingest_sources(store.as_ref(), &config.blacklist_sources, &http).await;
        store
    } else {
        info!(file = %config.db_file, "starting DNS proxy with ad filter (db backend)");
        let fresh = !std::path::Path::new(&config.db_file).exists();
        let store = Arc::new(DbDomainStore::open(&config.db_file)?);
        if fresh {
            ingest_sources(store.as_ref(), &config.blacklist_sources, &http).await;
        }
        store
    };

    let resolver = Arc::new(RacingResolver::new(
        &config.nameservers,
        config.switch_interval(),
        config.query_timeout(),
        http,
    )?);
    let cache = Arc::new(AnswerCache::new(
        config.cache_max_ttl(),
        config.cache_cleanup_interval(),
    ));
    let sweeper = cache.spawn_sweeper();

    let engine = Arc::new(QueryEngine::new(
        resolver,
        Arc::clone(&blacklist),
        whitelist,
        cache,
        config.reject(),
    ));

    info!(
        listen = %config.listen_address,
        blocked = blacklist.len(),
        "starting listeners"
    );

    let server = Arc::new(Server::bind(config.listen_addr()?, engine).await?);
    let runner = Arc::clone(&server);
    let task = tokio::spawn(async move { runner.run().await });

    shutdown_signal().await;
    server.shutdown();
    let _ = task.await;
    sweeper.abort();
    // Dropping the blacklist store flushes and releases the db file.
    Ok(())
}

async fn init_db(config: &Config, file: Option<PathBuf>) -> Result<()> {
    let path = file.unwrap_or_else(|| PathBuf::from(&config.db_file));
    if path.as_os_str().is_empty() {
        return Err(Error::config_field(
            "no database file configured and none given with --file",
            "db_file",
        ));
    }
    if path.exists() {
        return Err(Error::config(format!(
            "{} already exists, aborting",
            path.display()
        )));
    }

    let http = build_http_client(config)?;
    let store = DbDomainStore::open(&path)?;
    ingest_sources(&store, &config.blacklist_sources, &http).await;
    Ok(())
}

async fn parse_source(config: &Config, source: &str) -> Result<()> {
    let http = build_http_client(config)?;
    let reader = open_feed(source, &http).await?;

    let count = parse_lines(reader, |token| {
        println!("{token}");
        true
    })
    .await?;

    info!(count, "entries parsed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("interrupt received"),
            _ = terminate.recv() => info!("terminate signal received"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("interrupt received");
    }
}
