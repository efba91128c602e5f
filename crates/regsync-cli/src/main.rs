use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use regsync_core::app::{
    ChangeFeedPollHandler, HandlerRegistry, Scheduler, SyncOrchestrator, TaskHandler,
};
use regsync_core::config::{Config, StoreKind};
use regsync_core::domain::{Outcome, PackageSyncData, SyncError, Task, TaskType};
use regsync_core::impls::sqlite_store;
use regsync_core::impls::{
    InMemoryCursorStore, InMemoryHintQueue, InMemoryTaskStore, ReqwestFeedClient,
    SqliteCursorStore, SqliteTaskStore,
};
use regsync_core::ports::{Clock, CursorStore, SystemClock, TaskStore, UlidGenerator};
use regsync_core::source::{RegistrySource, build_source};

const DEFAULT_CONFIG: &str = "regsync.toml";

#[derive(Parser)]
#[command(name = "regsync", version, about = "Registry change-feed sync worker")]
struct Cli {
    /// Config file. Without it `./regsync.toml` is used when present.
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Poll, execute and sweep until Ctrl-C
    Run,

    /// Run one poll cycle of a registry
    Ingest { registry: String },

    /// Recover timed-out tasks once
    Sweep,

    /// Queue a package sync
    Enqueue {
        name: String,
        /// Versions to sync; none means every version
        #[arg(long = "version")]
        versions: Vec<String>,
        /// Defaults to the first configured registry
        #[arg(long)]
        registry: Option<String>,
    },

    /// Print task counts as JSON
    Status,
}

/// Stand-in for the package sync worker: records the task and succeeds.
struct LoggingSyncHandler;

#[async_trait]
impl TaskHandler for LoggingSyncHandler {
    async fn handle(&self, task: &Task) -> Result<Outcome, SyncError> {
        let data = PackageSyncData::from_data(&task.data).unwrap_or_default();
        tracing::info!(
            task_id = %task.task_id,
            name = %task.target_name,
            registry = ?data.registry_id,
            versions = ?data.specific_versions,
            deleted = data.deleted,
            changes = data.change_count,
            "package sync"
        );
        Ok(Outcome::success())
    }
}

struct App {
    config: Config,
    orchestrator: Arc<SyncOrchestrator>,
    sources: Vec<Arc<dyn RegistrySource>>,
}

impl App {
    async fn build(config: Config) -> anyhow::Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let hints = Arc::new(InMemoryHintQueue::new());
        let stores: (Arc<dyn TaskStore>, Arc<dyn CursorStore>) = match config.store.kind {
            StoreKind::Memory => (
                Arc::new(InMemoryTaskStore::new(clock.clone(), hints)),
                Arc::new(InMemoryCursorStore::new()),
            ),
            StoreKind::Sqlite => {
                let url = config
                    .store
                    .url
                    .as_deref()
                    .context("store.url is required for sqlite")?;
                let pool = sqlite_store::connect(url)
                    .await
                    .with_context(|| format!("open store {url}"))?;
                (
                    Arc::new(SqliteTaskStore::new(pool.clone(), clock.clone(), hints)),
                    Arc::new(SqliteCursorStore::new(pool, clock.clone())),
                )
            }
        };
        let (store, cursors) = stores;

        let mut sources = Vec::with_capacity(config.registries.len());
        for registry in &config.registries {
            let client = ReqwestFeedClient::new(registry.token.clone())
                .with_context(|| format!("http client for {}", registry.id))?;
            sources.push(build_source(registry.clone(), Arc::new(client), clock.clone()));
        }

        let orchestrator = Arc::new(SyncOrchestrator::new(
            store,
            cursors,
            Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            config.orchestrator_options(),
        ));
        Ok(Self {
            config,
            orchestrator,
            sources,
        })
    }

    fn source(&self, registry: &str) -> anyhow::Result<&Arc<dyn RegistrySource>> {
        match self.sources.iter().find(|s| s.registry_id() == registry) {
            Some(source) => Ok(source),
            None => bail!("registry {registry:?} is not configured"),
        }
    }

    fn handlers(&self) -> anyhow::Result<HandlerRegistry> {
        let mut handlers = HandlerRegistry::new();
        handlers.register(
            TaskType::ChangeFeedPoll,
            Arc::new(ChangeFeedPollHandler::new(
                self.orchestrator.clone(),
                self.sources.iter().cloned(),
            )),
        )?;
        handlers.register(TaskType::PackageSync, Arc::new(LoggingSyncHandler))?;
        Ok(handlers)
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let path = match path {
        Some(path) => path,
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG);
            if !default.exists() {
                tracing::info!("no {DEFAULT_CONFIG}, using in-memory defaults");
                return Ok(Config::default());
            }
            default
        }
    };
    Config::load(&path).with_context(|| format!("load {}", path.display()))
}

fn print_json(value: &impl Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let app = App::build(load_config(cli.config)?).await?;

    match cli.cmd {
        Command::Run => {
            if app.sources.is_empty() {
                tracing::warn!("no registries configured; only queued tasks will run");
            }
            let registries = app
                .sources
                .iter()
                .map(|s| s.registry_id().to_string())
                .collect();
            let scheduler = Scheduler::spawn(
                app.orchestrator.clone(),
                Arc::new(app.handlers()?),
                registries,
                app.config.scheduler_options(),
            );
            tracing::info!("scheduler started");
            tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
            tracing::info!("shutting down");
            scheduler.shutdown_and_join().await;
        }
        Command::Ingest { registry } => {
            let source = app.source(&registry)?;
            let report = app.orchestrator.ingest_once(source.as_ref()).await?;
            print_json(&report)?;
        }
        Command::Sweep => {
            let counts = app.orchestrator.run_timeout_sweep().await?;
            print_json(&counts)?;
        }
        Command::Enqueue {
            name,
            versions,
            registry,
        } => {
            let registry = registry.or_else(|| app.config.registries.first().map(|r| r.id.clone()));
            let registry = match registry {
                Some(registry) => registry,
                None => bail!("--registry is required when no registry is configured"),
            };
            let outcome = app
                .orchestrator
                .enqueue_package_sync(&registry, &name, versions)
                .await?;
            if outcome.is_created() {
                tracing::info!(%registry, %name, "created sync task");
            } else {
                tracing::info!(%registry, %name, "merged into pending sync task");
            }
            print_json(outcome.task())?;
        }
        Command::Status => {
            let counts = app.orchestrator.store().count_by_state().await?;
            print_json(&counts)?;
        }
    }
    Ok(())
}
