//! Binary entrypoint for draw-this.

use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use draw_this::config::{BackendKind, Configuration};
use draw_this::crawler::Crawler;
use draw_this::loader::Loader;
use draw_this::store::{IndexStore, Root, RootId};

#[derive(Debug, Parser)]
#[command(
    name = "draw-this",
    version,
    about = "Shuffled slideshow over indexed image folders"
)]
struct Args {
    /// Path to YAML config. Defaults apply when the file does not exist.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage indexed root folders
    Roots {
        #[command(subcommand)]
        action: RootsCommand,
    },
    /// Walk roots and index their images (all roots when none are given)
    Crawl {
        #[arg(long = "root", value_name = "ID")]
        roots: Vec<i64>,
    },
    /// Drop records of a root not seen since an instant
    Prune {
        #[arg(long, value_name = "ID")]
        root: i64,
        #[arg(long, value_name = "RFC3339")]
        before: String,
    },
    /// Run a slideshow over the active images (all roots when none are given)
    Show {
        #[arg(long = "root", value_name = "ID")]
        roots: Vec<i64>,
        /// Deterministic shuffle seed
        #[arg(long, value_name = "SEED")]
        seed: Option<u64>,
        #[arg(long, value_enum)]
        backend: Option<BackendArg>,
        /// Time per image, e.g. "45s" or "2m"
        #[arg(long, value_name = "DURATION")]
        timer: Option<humantime::Duration>,
        /// Disable the timer; navigation stays manual
        #[arg(long, conflicts_with = "timer")]
        no_timer: bool,
    },
}

#[derive(Debug, Subcommand)]
enum RootsCommand {
    Add {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },
    List,
    Toggle {
        #[arg(value_name = "ID")]
        id: i64,
        #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
        active: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum BackendArg {
    External,
    Accelerated,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::External => Self::External,
            BackendArg::Accelerated => Self::Accelerated,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG controls level, default = info
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,wgpu=warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let Args { config, command } = Args::parse();
    let cfg = load_configuration(config.as_deref())?;

    match command {
        Command::Roots { action } => run_roots(&cfg, action),
        Command::Crawl { roots } => run_crawl(&cfg, &roots),
        Command::Prune { root, before } => run_prune(&cfg, root, &before),
        Command::Show {
            roots,
            seed,
            backend,
            timer,
            no_timer,
        } => {
            let mut cfg = cfg;
            if let Some(backend) = backend {
                cfg.session.backend = backend.into();
            }
            if let Some(timer) = timer {
                cfg.session.timer = Some(timer.into());
            }
            if no_timer {
                cfg.session.timer = None;
            }
            if seed.is_some() {
                cfg.session.shuffle_seed = seed;
            }
            let cfg = cfg.validated().context("invalid command-line overrides")?;
            run_show(cfg, &roots).await
        }
    }
}

fn load_configuration(path: Option<&Path>) -> Result<Configuration> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("draw-this")
            .join("config.yaml"),
    };
    let cfg = if path.exists() {
        Configuration::from_yaml_file(&path)
            .with_context(|| format!("failed to load configuration from {}", path.display()))?
    } else {
        info!(path = %path.display(), "no configuration file; using defaults");
        Configuration::default()
    };
    cfg.validated().context("invalid configuration values")
}

fn open_store(cfg: &Configuration) -> Result<IndexStore> {
    if let Some(parent) = cfg.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    IndexStore::open(&cfg.database_path, cfg.crawl.batch_size)
        .with_context(|| format!("failed to open index at {}", cfg.database_path.display()))
}

fn select_roots(store: &IndexStore, ids: &[i64]) -> Result<Vec<Root>> {
    if ids.is_empty() {
        return Ok(store.roots()?);
    }
    ids.iter()
        .map(|&id| {
            store
                .root(RootId(id))?
                .with_context(|| format!("unknown root {id}"))
        })
        .collect()
}

fn run_roots(cfg: &Configuration, action: RootsCommand) -> Result<()> {
    let mut store = open_store(cfg)?;
    match action {
        RootsCommand::Add { dir } => {
            if !dir.is_dir() {
                bail!("{} is not a directory", dir.display());
            }
            let root = store.add_root(&dir)?;
            println!("{}\t{}", root.id, root.path.display());
        }
        RootsCommand::List => {
            for root in store.roots()? {
                let crawled = root
                    .last_crawled
                    .map_or_else(|| "never".to_owned(), |at| at.to_rfc3339());
                let state = if root.active { "active" } else { "inactive" };
                println!("{}\t{state}\t{crawled}\t{}", root.id, root.path.display());
            }
        }
        RootsCommand::Toggle { id, active } => {
            store.set_root_active(RootId(id), active)?;
            info!(root = id, active, "root toggled");
        }
    }
    Ok(())
}

fn run_crawl(cfg: &Configuration, ids: &[i64]) -> Result<()> {
    let mut store = open_store(cfg)?;
    let roots = select_roots(&store, ids)?;
    if roots.is_empty() {
        warn!("no roots to crawl; add one with `draw-this roots add <DIR>`");
        return Ok(());
    }
    let report = Crawler::new(cfg.crawl.clone())
        .crawl(&mut store, &roots)
        .context("crawl failed")?;
    for root in &report.roots {
        println!(
            "{}\t{}\tnew {}\trefreshed {}\tskipped dirs {}",
            root.root,
            root.path.display(),
            root.created,
            root.refreshed,
            root.soft_failures.len()
        );
        for failure in &root.soft_failures {
            warn!(%failure, "subtree skipped");
        }
        if let Some(err) = &root.halted_by {
            warn!(root = %root.root, %err, "crawl halted; re-crawl to resume");
        }
    }
    if !report.completed() {
        bail!("crawl did not complete for every root");
    }
    Ok(())
}

fn run_prune(cfg: &Configuration, root: i64, before: &str) -> Result<()> {
    let before: DateTime<Utc> = DateTime::parse_from_rfc3339(before)
        .context("failed to parse --before")?
        .with_timezone(&Utc);
    let mut store = open_store(cfg)?;
    let removed = store.prune_unseen(RootId(root), before)?;
    println!("removed {removed} records");
    Ok(())
}

async fn run_show(cfg: Configuration, ids: &[i64]) -> Result<()> {
    let store = open_store(&cfg)?;
    let roots: Vec<RootId> = select_roots(&store, ids)?.iter().map(|r| r.id).collect();
    let loader = Arc::new(Mutex::new(Loader::new(store, cfg.session.shuffle_seed)));

    let mut session = draw_this::start_session(loader, &roots, &cfg)
        .await
        .context("failed to start session")?;
    if session.sequence().is_empty() {
        println!("no active images; crawl a root first or enable one with `roots toggle`");
        return Ok(());
    }

    let cancel = CancellationToken::new();

    // Ctrl-D/Ctrl-C stop the session
    if io::stdin().is_terminal() {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            let mut sink = Vec::new();
            match io::stdin().read_to_end(&mut sink) {
                Ok(_) => info!("stdin closed; stopping session"),
                Err(err) => warn!("stdin watcher failed: {err}"),
            }
            cancel.cancel();
        });
    }
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {err}");
                return;
            }
            info!("ctrl-c received; stopping session");
            cancel.cancel();
        });
    }

    tokio::select! {
        reason = session.wait() => info!(?reason, "session ended"),
        () = cancel.cancelled() => {}
    }
    let reason = draw_this::stop_session(session).await;
    match reason {
        draw_this::events::EndReason::BackendFailed(detail) => bail!("render backend failed: {detail}"),
        draw_this::events::EndReason::Stopped => Ok(()),
    }
}
