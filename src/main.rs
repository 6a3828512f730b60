mod app;
mod domain;
mod error;
mod repo;
mod ui;
mod usecase;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::debug;

use app::auth::AuthModel;
use app::tasks::TaskStore;
use repo::memory::{InMemoryAuth, InMemoryDocumentStore};
use repo::sqlite::SqliteBackend;
use repo::{AuthProvider, DocumentStore};
use usecase::identity::IdentityGate;

const DEMO_EMAIL: &str = "demo@taskfeed.local";
const DEMO_PASSWORD: &str = "demo-password";

#[derive(Parser, Debug)]
#[command(author, version, about = "taskfeed: per-user todo list over a live document feed", long_about = None)]
struct Args {
    /// Path to SQLite DB file (default: OS data dir)
    #[arg(long, env = "TASKFEED_DB", global = true)]
    db_path: Option<PathBuf>,

    /// Use an in-memory store with a signed-in demo account and demo tasks
    #[arg(long, default_value_t = false, global = true)]
    demo: bool,

    /// How often live feeds re-read the database, in milliseconds
    #[arg(long, default_value_t = 500, global = true)]
    poll_ms: u64,

    /// How long to wait for the first task snapshot, in milliseconds
    #[arg(long, default_value_t = 3000, global = true)]
    wait_ms: u64,

    #[command(subcommand)]
    command: ui::Command,
}

#[derive(Debug, Clone)]
enum Storage {
    Demo,
    Sqlite(Option<PathBuf>),
}

#[derive(Debug, Clone)]
struct Config {
    storage: Storage,
    poll_interval: Duration,
    first_snapshot_timeout: Duration,
}

impl Config {
    fn from_args(args: &Args) -> Self {
        let storage = if args.demo {
            Storage::Demo
        } else {
            Storage::Sqlite(args.db_path.clone())
        };
        Self {
            storage,
            poll_interval: Duration::from_millis(args.poll_ms.max(1)),
            first_snapshot_timeout: Duration::from_millis(args.wait_ms),
        }
    }
}

/// The collaborators every view-model is built from.
struct Backend {
    documents: Arc<dyn DocumentStore>,
    auth: Arc<dyn AuthProvider>,
    identity: Arc<dyn IdentityGate>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let config = Config::from_args(&args);
    debug!("starting with {config:?}");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    rt.block_on(async move {
        let backend = open_backend(&config).await?;
        let session = ui::Session {
            auth: AuthModel::new(backend.auth),
            tasks: TaskStore::new(backend.documents, backend.identity),
            wait: config.first_snapshot_timeout,
        };
        ui::run(session, args.command).await
    })
}

async fn open_backend(config: &Config) -> Result<Backend> {
    match &config.storage {
        Storage::Demo => open_demo().await,
        Storage::Sqlite(path) => {
            let db = match path {
                Some(path) => SqliteBackend::open(path, config.poll_interval)?,
                None => SqliteBackend::open_default(config.poll_interval)?,
            };
            let db = Arc::new(db);
            Ok(Backend {
                documents: db.clone(),
                auth: db.clone(),
                identity: db,
            })
        }
    }
}

async fn open_demo() -> Result<Backend> {
    let documents = Arc::new(InMemoryDocumentStore::default());
    let auth = Arc::new(InMemoryAuth::with_account(DEMO_EMAIL, DEMO_PASSWORD));
    let seeder = TaskStore::new(documents.clone(), auth.clone());
    for title in seed_titles() {
        if let Some(pending) = seeder.add(title) {
            pending.wait().await?;
        }
    }
    Ok(Backend {
        documents,
        auth: auth.clone(),
        identity: auth,
    })
}

fn seed_titles() -> [&'static str; 3] {
    [
        "Write documentation",
        "Check PRs waiting for review",
        "Draft release notes",
    ]
}
