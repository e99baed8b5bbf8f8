use anyhow::{Context, Result};
use chrono::Duration as RetentionWindow;
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Settings the vault engine and the garbage collector run with.
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// How long a deleted message stays recoverable.
    pub retention: RetentionWindow,
    /// Buckets the garbage collector deletes concurrently.
    pub gc_parallelism: usize,
    /// Upper bound for every single blob store or metadata store call.
    pub store_timeout: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            retention: RetentionWindow::days(7),
            gc_parallelism: 4,
            store_timeout: Duration::from_secs(30),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub vault: VaultConfig,
    /// Seconds between scheduled GC runs; `None` disables the scheduler.
    pub gc_interval: Option<Duration>,
}

/// What the binary should do once configured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Serve,
    Migrate,
    CollectGarbage,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Retention-managed vault for deleted mail messages")]
pub struct Args {
    /// Host to bind to (overrides VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where message blobs are stored (overrides VAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Retention window in days (overrides VAULT_RETENTION_DAYS)
    #[arg(long)]
    pub retention_days: Option<u32>,

    /// Buckets deleted concurrently by GC (overrides VAULT_GC_PARALLELISM)
    #[arg(long)]
    pub gc_parallelism: Option<usize>,

    /// Timeout for each store call in seconds (overrides VAULT_STORE_TIMEOUT_SECS)
    #[arg(long)]
    pub store_timeout_secs: Option<u64>,

    /// Seconds between scheduled GC runs, 0 disables (overrides VAULT_GC_INTERVAL_SECS)
    #[arg(long)]
    pub gc_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Run one garbage collection pass and exit
    #[arg(long, conflicts_with = "migrate")]
    pub gc: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and run mode.
    pub fn from_env_and_args() -> Result<(Self, Mode)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, Mode)> {
        // --- Environment fallback ---
        let env_host = env::var("VAULT_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("VAULT_PORT", 3000u16)?;
        let env_storage = env::var("VAULT_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_db = env::var("VAULT_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/vault.db".into());
        let env_retention = env_or("VAULT_RETENTION_DAYS", 7u32)?;
        let env_parallelism = env_or("VAULT_GC_PARALLELISM", 4usize)?;
        let env_timeout = env_or("VAULT_STORE_TIMEOUT_SECS", 30u64)?;
        let env_interval = env_or("VAULT_GC_INTERVAL_SECS", 86_400u64)?;

        // --- Merge ---
        let interval_secs = args.gc_interval_secs.unwrap_or(env_interval);
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            vault: VaultConfig {
                retention: RetentionWindow::days(i64::from(
                    args.retention_days.unwrap_or(env_retention),
                )),
                gc_parallelism: args.gc_parallelism.unwrap_or(env_parallelism).max(1),
                store_timeout: Duration::from_secs(
                    args.store_timeout_secs.unwrap_or(env_timeout).max(1),
                ),
            },
            gc_interval: (interval_secs > 0).then(|| Duration::from_secs(interval_secs)),
        };

        let mode = if args.migrate {
            Mode::Migrate
        } else if args.gc {
            Mode::CollectGarbage
        } else {
            Mode::Serve
        };

        Ok((cfg, mode))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
