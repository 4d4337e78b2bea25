//! The tracehub server: accepts framed span submissions over TCP
//! (optionally TLS) and keeps them queryable in an in-memory store chain.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tracehub::store::{persist_every, PersistentStore};
use tracehub::{
    AggregateStore, Collector, CollectorServer, LimitStore, MemoryStore, RecentStore,
};

mod sample;

#[derive(Debug, Parser)]
#[command(name = "tracehub-server", version, about)]
struct Args {
    /// Address the collector listens on.
    #[arg(long, default_value = "127.0.0.1:7701")]
    collector_addr: String,

    /// Address reserved for the HTTP UI (served by a separate frontend).
    #[arg(long, default_value = "127.0.0.1:7700")]
    http_addr: String,

    /// PEM certificate chain for TLS on the collector listener.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,

    /// PEM private key for TLS on the collector listener.
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Seed the store with synthetic sample traces.
    #[arg(long)]
    sample_data: bool,

    /// Maximum number of traces retained in memory.
    #[arg(long, default_value_t = 10_000)]
    max_traces: usize,

    /// Delete traces older than this many seconds.
    #[arg(long, default_value_t = 72 * 60 * 60)]
    trace_ttl_secs: u64,

    /// Aggregate traces by root span name, retaining only the slowest
    /// few per name, instead of retaining every trace.
    #[arg(long)]
    aggregate: bool,

    /// Snapshot the in-memory store to this file once a minute, and
    /// restore from it on startup.
    #[arg(long)]
    store_file: Option<PathBuf>,

    /// Debug logging.
    #[arg(long)]
    debug: bool,

    /// Trace logging (overrides --debug).
    #[arg(long)]
    trace: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("tracehub-server: {err:#}");
        process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let default_level = if args.trace {
        "trace"
    } else if args.debug {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let ttl = Duration::from_secs(args.trace_ttl_secs);
    let (collector, persist_target): (Arc<dyn Collector>, Arc<MemoryStore>) = if args.aggregate {
        let aggregate = Arc::new(AggregateStore::new().with_min_evict_age(ttl));
        let output = Arc::clone(aggregate.output());
        info!("aggregating traces by root span name");
        (aggregate, output)
    } else {
        let memory = Arc::new(MemoryStore::new());
        let limit = Arc::new(LimitStore::new(args.max_traces, Arc::clone(&memory)));
        let recent = Arc::new(RecentStore::new(ttl, limit));
        (recent, memory)
    };

    if let Some(path) = &args.store_file {
        if path.exists() {
            let mut file = File::open(path)
                .with_context(|| format!("opening snapshot {}", path.display()))?;
            let traces = persist_target
                .read_from(&mut file)
                .with_context(|| format!("restoring snapshot {}", path.display()))?;
            info!(traces, path = %path.display(), "restored store snapshot");
        }
    }
    let _persister = args.store_file.as_ref().map(|path| {
        persist_every(
            Arc::clone(&persist_target) as Arc<dyn PersistentStore + Send + Sync>,
            Duration::from_secs(60),
            path,
        )
    });

    if args.sample_data {
        sample::seed(Arc::clone(&collector)).context("seeding sample data")?;
    }

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(load_tls(cert, key)?),
        _ => None,
    };

    let listener = TcpListener::bind(&args.collector_addr)
        .await
        .with_context(|| format!("binding collector listener on {}", args.collector_addr))?;
    info!(
        collector = %listener.local_addr()?,
        http = %args.http_addr,
        tls = tls.is_some(),
        "tracehub server starting"
    );

    let mut server = CollectorServer::new(collector);
    if let Some(acceptor) = tls {
        server = server.with_tls(acceptor);
    }
    let server = Arc::new(server);

    let interrupted = Arc::clone(&server);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupted.shutdown();
        }
    });

    server.serve(listener).await.context("collector server")?;
    Ok(())
}

fn load_tls(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs: Vec<rustls::Certificate> = rustls_pemfile::certs(&mut BufReader::new(
        File::open(cert_path).with_context(|| format!("opening {}", cert_path.display()))?,
    ))
    .context("reading TLS certificates")?
    .into_iter()
    .map(rustls::Certificate)
    .collect();
    if certs.is_empty() {
        bail!("no certificates in {}", cert_path.display());
    }

    let open_key = || -> Result<BufReader<File>> {
        Ok(BufReader::new(File::open(key_path).with_context(|| {
            format!("opening {}", key_path.display())
        })?))
    };
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut open_key()?)
        .context("reading TLS private key")?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut open_key()?)
            .context("reading TLS private key")?;
    }
    let Some(key) = keys.into_iter().next() else {
        bail!("no private key in {}", key_path.display());
    };

    let config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, rustls::PrivateKey(key))
        .context("building TLS config")?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}
