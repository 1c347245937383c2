use crate::models::bucket::BucketInfo;
use anyhow::{Context, Result, anyhow, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Prefix for generated delivery URLs (e.g. a CDN host).
    pub public_url: Option<String>,
    pub shared_secret: Option<String>,
    pub buckets: Vec<BucketInfo>,
    pub conversion_command: Option<String>,
    pub extend_option: Option<String>,
    pub version_workers: usize,
    pub version_queue: usize,
    pub sweep_interval_secs: u64,
    pub temporary_grace_minutes: i64,
    pub sweep_batch: i64,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("storage_dir", &self.storage_dir)
            .field("database_url", &self.database_url)
            .field("public_url", &self.public_url)
            .field("shared_secret", &self.shared_secret.as_ref().map(|_| "<redacted>"))
            .field("buckets", &self.buckets)
            .field("conversion_command", &self.conversion_command)
            .field("extend_option", &self.extend_option)
            .field("version_workers", &self.version_workers)
            .field("version_queue", &self.version_queue)
            .field("sweep_interval_secs", &self.sweep_interval_secs)
            .field("temporary_grace_minutes", &self.temporary_grace_minutes)
            .field("sweep_batch", &self.sweep_batch)
            .finish()
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Virtual object storage with derived image versions")]
pub struct Args {
    /// Host to bind to (overrides OBJECT_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides OBJECT_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where blobs are stored (overrides OBJECT_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides OBJECT_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Prefix of generated delivery URLs (overrides OBJECT_STORE_PUBLIC_URL)
    #[arg(long)]
    pub public_url: Option<String>,

    /// Secret authenticating delivery URLs (overrides OBJECT_STORE_SHARED_SECRET)
    #[arg(long)]
    pub shared_secret: Option<String>,

    /// Bucket as `name[:retention_days[:backend[:permission]]]`, repeatable
    /// (overrides OBJECT_STORE_BUCKETS)
    #[arg(long = "bucket")]
    pub buckets: Vec<String>,

    /// External image conversion command (overrides OBJECT_STORE_CONVERSION_COMMAND)
    #[arg(long)]
    pub conversion_command: Option<String>,

    /// Template expanded into `${extend}` of the conversion command
    /// (overrides OBJECT_STORE_EXTEND_OPTION)
    #[arg(long)]
    pub extend_option: Option<String>,

    /// Concurrent version computations (overrides OBJECT_STORE_VERSION_WORKERS)
    #[arg(long)]
    pub version_workers: Option<usize>,

    /// Pending version computations before requests are dropped
    /// (overrides OBJECT_STORE_VERSION_QUEUE)
    #[arg(long)]
    pub version_queue: Option<usize>,

    /// Seconds between retention sweeps (overrides OBJECT_STORE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Minutes an unclaimed upload is kept (overrides OBJECT_STORE_TEMPORARY_GRACE_MINUTES)
    #[arg(long)]
    pub temporary_grace_minutes: Option<i64>,

    /// Objects deleted per sweep phase (overrides OBJECT_STORE_SWEEP_BATCH)
    #[arg(long)]
    pub sweep_batch: Option<i64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        let buckets = if args.buckets.is_empty() {
            env_string("OBJECT_STORE_BUCKETS")
                .unwrap_or_else(|| "default".into())
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            args.buckets
        };
        let buckets = buckets
            .iter()
            .map(|definition| BucketInfo::from_str(definition).map_err(|err| anyhow!(err)))
            .collect::<Result<Vec<_>>>()?;

        // --- Merge, CLI first ---
        let cfg = Self {
            host: args
                .host
                .or_else(|| env_string("OBJECT_STORE_HOST"))
                .unwrap_or_else(|| "0.0.0.0".into()),
            port: pick(args.port, "OBJECT_STORE_PORT", 3000)?,
            storage_dir: args
                .storage_dir
                .or_else(|| env_string("OBJECT_STORE_STORAGE_DIR"))
                .unwrap_or_else(|| "./data/objects".into()),
            database_url: args
                .database_url
                .or_else(|| env_string("OBJECT_STORE_DATABASE_URL"))
                .unwrap_or_else(|| "sqlite://./data/meta/virtual_storage.db".into()),
            public_url: args.public_url.or_else(|| env_string("OBJECT_STORE_PUBLIC_URL")),
            shared_secret: args
                .shared_secret
                .or_else(|| env_string("OBJECT_STORE_SHARED_SECRET")),
            buckets,
            conversion_command: args
                .conversion_command
                .or_else(|| env_string("OBJECT_STORE_CONVERSION_COMMAND")),
            extend_option: args
                .extend_option
                .or_else(|| env_string("OBJECT_STORE_EXTEND_OPTION")),
            version_workers: pick(args.version_workers, "OBJECT_STORE_VERSION_WORKERS", 2)?,
            version_queue: pick(args.version_queue, "OBJECT_STORE_VERSION_QUEUE", 64)?,
            sweep_interval_secs: pick(
                args.sweep_interval_secs,
                "OBJECT_STORE_SWEEP_INTERVAL_SECS",
                60 * 60,
            )?,
            temporary_grace_minutes: pick(
                args.temporary_grace_minutes,
                "OBJECT_STORE_TEMPORARY_GRACE_MINUTES",
                60,
            )?,
            sweep_batch: pick(args.sweep_batch, "OBJECT_STORE_SWEEP_BATCH", 256)?,
        };

        cfg.validate()?;
        Ok((cfg, args.migrate))
    }

    /// Rejects settings which would stall version computation or unbound the sweep.
    pub fn validate(&self) -> Result<()> {
        if self.version_workers == 0 {
            bail!("version workers must be at least 1");
        }
        if self.version_queue == 0 {
            bail!("version queue capacity must be at least 1");
        }
        if self.sweep_batch < 1 {
            bail!("sweep batch size must be at least 1, got {}", self.sweep_batch);
        }
        if self.temporary_grace_minutes < 0 {
            bail!(
                "temporary grace period must not be negative, got {} minutes",
                self.temporary_grace_minutes
            );
        }
        Ok(())
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn env_string(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// CLI value if given, else the parsed environment variable, else the default.
fn pick<T>(cli: Option<T>, name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(value) = cli {
        return Ok(value);
    }
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("parsing {name} value `{value}`")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {name}")),
    }
}
