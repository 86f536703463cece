mod archive;
mod backup;
mod blaster;
mod blossom;
mod cloud;
mod config;
mod importer;
mod policy;
mod relay;
mod server;
mod store;
mod wot;
mod ws;

use std::{net::SocketAddr, path::Path, sync::Arc};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nostr_sdk::Client;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{filter::LevelFilter, EnvFilter};

use crate::{
    archive::StoreSet,
    blaster::Blaster,
    blossom::BlobStore,
    cloud::{ObjectStorage, S3Provider},
    config::{Settings, DB_ROOT},
    importer::Importer,
    server::AppState,
    wot::TrustNetwork,
};

const BANNER: &str = r"
 _   _  ___     _______ _   _
| | | |/ \ \   / / ____| \ | |
| |_| / _ \ \ / /|  _| |  \| |
|  _  / ___ \ V / | |___| |\  |
|_| |_/_/  \_\_/  |_____|_| \_|
high availability vault for events on nostr
";

/// Command line interface entry point.
#[derive(Parser)]
#[command(name = "haven", version, about = "Personal multi-relay Nostr server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Supported CLI subcommands; no subcommand runs the server.
#[derive(Subcommand)]
enum Commands {
    /// Export the archive zip (default) or one store as JSONL.
    Backup {
        /// Export a single relay store (private|chat|outbox|inbox|blossom).
        #[arg(short, long)]
        relay: Option<String>,
        /// Output file path.
        #[arg(short, long)]
        outfile: Option<String>,
        /// Upload the result to the configured bucket afterwards.
        #[arg(long)]
        to_cloud: bool,
        /// Output file path (positional alternative to --outfile).
        file: Option<String>,
    },
    /// Import the archive zip (default) or one store from JSONL.
    Restore {
        /// Import into a single relay store.
        #[arg(short, long)]
        relay: Option<String>,
        /// Input file path.
        #[arg(short, long)]
        infile: Option<String>,
        /// Download the input from the configured bucket first.
        #[arg(long)]
        from_cloud: bool,
        /// Input file path (positional alternative to --infile).
        file: Option<String>,
    },
    /// Run the owner-notes and tagged-notes backfills, then exit.
    Import,
}

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("HAVEN_LOG_LEVEL")
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> Result<()> {
    let cfg = Settings::from_env()?;
    match cli.command {
        None => serve(cfg).await,
        Some(Commands::Backup {
            relay,
            outfile,
            to_cloud,
            file,
        }) => backup_cmd(cfg, relay, outfile.or(file), to_cloud).await,
        Some(Commands::Restore {
            relay,
            infile,
            from_cloud,
            file,
        }) => restore_cmd(cfg, relay, infile.or(file), from_cloud).await,
        Some(Commands::Import) => import_cmd(cfg).await,
    }
}

/// Open the five stores under `db/`, all on the configured engine.
fn open_stores(cfg: &Settings) -> Result<StoreSet> {
    let open = |name: &str| {
        store::open(cfg.db_engine, Path::new(DB_ROOT).join(name))
            .with_context(|| format!("opening {name} store"))
    };
    Ok(StoreSet {
        private: open("private")?,
        chat: open("chat")?,
        outbox: open("outbox")?,
        inbox: open("inbox")?,
        blossom: open("blossom")?,
    })
}

/// Run the server: four relays, blaster, trust refresher, live subscriber,
/// backup ticker.
async fn serve(cfg: Settings) -> Result<()> {
    println!("{BANNER}");
    info!("haven is booting up");
    info!("owner: {}", cfg.owner_npub);

    std::fs::create_dir_all(&cfg.blossom_path).context("creating blossom directory")?;
    let stores = open_stores(&cfg)?;
    info!("private relay limits: {:?}", cfg.limits.private);
    info!("chat relay limits: {:?}", cfg.limits.chat);
    info!("inbox relay limits: {:?}", cfg.limits.inbox);
    info!("outbox relay limits: {:?}", cfg.limits.outbox);

    let shutdown = CancellationToken::new();
    let trust = Arc::new(TrustNetwork::new(
        cfg.owner_pubkey,
        cfg.import_seed_relays.clone(),
        cfg.wot.clone(),
    ));

    let blast_tx = Blaster::new(cfg.blastr_relays.clone())
        .await
        .spawn(shutdown.clone());

    let state = Arc::new(AppState {
        private: Arc::new(relay::build_private(&cfg, Arc::clone(&stores.private))?),
        chat: Arc::new(relay::build_chat(
            &cfg,
            Arc::clone(&stores.chat),
            Arc::clone(&trust),
        )?),
        inbox: Arc::new(relay::build_inbox(
            &cfg,
            Arc::clone(&stores.inbox),
            Arc::clone(&trust),
        )?),
        outbox: Arc::new(relay::build_outbox(
            &cfg,
            Arc::clone(&stores.outbox),
            Some(blast_tx),
        )?),
        blossom: Arc::new(BlobStore::new(
            cfg.blossom_path.clone(),
            cfg.owner_pubkey,
            Arc::clone(&stores.blossom),
            format!("https://{}", cfg.relay_url),
        )?),
    });

    // One upstream pool shared by the trust refresher and the subscriber.
    let pool = Client::default();
    if !cfg.import_seed_relays.is_empty() {
        importer::probe_seeds(&pool, &cfg.import_seed_relays).await?;
    }
    trust.refresh(&pool).await;

    {
        let trust = Arc::clone(&trust);
        let pool = pool.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { trust.refresh_loop(pool, token).await });
    }

    if !cfg.import_seed_relays.is_empty() {
        let importer = Importer::new(
            &cfg,
            Arc::clone(&trust),
            Arc::clone(&stores.outbox),
            Arc::clone(&stores.inbox),
            Arc::clone(&stores.chat),
            pool.clone(),
        );
        let token = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = importer.subscribe(token).await {
                warn!("inbox subscriber stopped: {e}");
            }
        });
    }

    if let Some(backup_cfg) = cfg.backup.clone() {
        let storage = S3Provider::new(&backup_cfg.s3);
        let stores = stores.clone();
        let token = shutdown.clone();
        tokio::spawn(async move { backup::run(&stores, &backup_cfg, &storage, token).await });
    }

    let addr: SocketAddr = format!("{}:{}", cfg.relay_bind_address, cfg.relay_port)
        .parse()
        .context("parsing listener address")?;
    let token = shutdown.clone();
    server::serve(addr, state, async move {
        shutdown_signal().await;
        token.cancel();
    })
    .await?;

    shutdown.cancel();
    stores.close_all();
    info!("haven shut down cleanly");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// `backup` subcommand: archive zip or single-store JSONL, optionally
/// uploaded.
async fn backup_cmd(
    cfg: Settings,
    relay: Option<String>,
    outfile: Option<String>,
    to_cloud: bool,
) -> Result<()> {
    let stores = open_stores(&cfg)?;
    let path = match &relay {
        Some(name) => {
            let store = stores
                .by_name(name)
                .with_context(|| format!("unknown relay: {name}"))?
                .clone();
            let path = outfile.unwrap_or_else(|| format!("{name}.jsonl"));
            let mut out =
                std::fs::File::create(&path).with_context(|| format!("creating {path}"))?;
            archive::export_store(store.as_ref(), &mut out)?;
            path
        }
        None => {
            let path = outfile.unwrap_or_else(|| backup::ARCHIVE_FILE.to_string());
            let out = std::fs::File::create(&path).with_context(|| format!("creating {path}"))?;
            archive::export_archive(&stores, out)?;
            path
        }
    };
    info!("export complete: {path}");

    if to_cloud {
        let settings = cfg
            .backup
            .as_ref()
            .context("--to-cloud requires BACKUP_PROVIDER=s3")?;
        let storage = S3Provider::new(&settings.s3);
        let object = Path::new(&path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&path);
        let content_type = if relay.is_some() {
            "application/jsonl"
        } else {
            backup::ARCHIVE_CONTENT_TYPE
        };
        storage
            .upload(&settings.s3.bucket, object, Path::new(&path), content_type)
            .await?;
        info!("uploaded {object} to bucket {}", settings.s3.bucket);
    }
    stores.close_all();
    Ok(())
}

/// `restore` subcommand: inverse of `backup`.
async fn restore_cmd(
    cfg: Settings,
    relay: Option<String>,
    infile: Option<String>,
    from_cloud: bool,
) -> Result<()> {
    let stores = open_stores(&cfg)?;
    let path = match &relay {
        Some(name) => infile.unwrap_or_else(|| format!("{name}.jsonl")),
        None => infile.unwrap_or_else(|| backup::ARCHIVE_FILE.to_string()),
    };

    if from_cloud {
        let settings = cfg
            .backup
            .as_ref()
            .context("--from-cloud requires BACKUP_PROVIDER=s3")?;
        let storage = S3Provider::new(&settings.s3);
        let object = Path::new(&path)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&path);
        storage
            .download(&settings.s3.bucket, object, Path::new(&path))
            .await?;
        info!("downloaded {object} from bucket {}", settings.s3.bucket);
    }

    match &relay {
        Some(name) => {
            let store = stores
                .by_name(name)
                .with_context(|| format!("unknown relay: {name}"))?
                .clone();
            let input =
                std::fs::File::open(&path).with_context(|| format!("opening {path}"))?;
            archive::import_store(store.as_ref(), input)?;
        }
        None => {
            let input =
                std::fs::File::open(&path).with_context(|| format!("opening {path}"))?;
            archive::import_archive(&stores, input)?;
        }
    }
    info!("restore complete: {path}");
    stores.close_all();
    Ok(())
}

/// `import` subcommand: refresh trust, then run both backfills.
async fn import_cmd(cfg: Settings) -> Result<()> {
    if cfg.import_seed_relays.is_empty() {
        bail!("IMPORT_SEED_RELAYS_FILE must name at least one seed relay");
    }
    tracing::debug!(
        "import query interval: {}s",
        cfg.import_query_interval_seconds
    );
    let stores = open_stores(&cfg)?;
    let pool = Client::default();
    importer::probe_seeds(&pool, &cfg.import_seed_relays).await?;

    let trust = Arc::new(TrustNetwork::new(
        cfg.owner_pubkey,
        cfg.import_seed_relays.clone(),
        cfg.wot.clone(),
    ));
    trust.refresh(&pool).await;

    let importer = Importer::new(
        &cfg,
        trust,
        Arc::clone(&stores.outbox),
        Arc::clone(&stores.inbox),
        Arc::clone(&stores.chat),
        pool,
    );
    info!("importing notes");
    importer.import_owner_notes().await?;
    importer.import_tagged_notes().await?;
    stores.close_all();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    run(cli).await
}
