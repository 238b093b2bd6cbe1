use anyhow::{Context, Result, ensure};
use clap::Parser;
use std::{env, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Accounts whose root and top-level directories are provisioned at start-up.
    pub accounts: Vec<String>,
    pub limits: UploadLimits,
}

/// Knobs that bound multipart uploads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadLimits {
    pub min_copies: u32,
    pub max_copies: u32,
    pub default_copies: u32,
    /// Maximum number of parts a commit may reference.
    pub max_parts: usize,
    /// Every part but the last must be at least this large.
    pub min_part_size: u64,
    pub max_part_size: u64,
    pub dir_entry_limit: u64,
    /// Attempts (including the first) for transient backend failures.
    pub backend_retries: u32,
}

impl Default for UploadLimits {
    fn default() -> Self {
        Self {
            min_copies: 1,
            max_copies: 9,
            default_copies: 2,
            max_parts: 10_000,
            min_part_size: 5 * 1024 * 1024,
            max_part_size: 5 * 1024 * 1024 * 1024,
            dir_entry_limit: 1_000_000,
            backend_retries: 3,
        }
    }
}

impl UploadLimits {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.min_copies >= 1 && self.min_copies <= self.max_copies,
            "copies range [{}, {}] is empty",
            self.min_copies,
            self.max_copies
        );
        ensure!(
            (self.min_copies..=self.max_copies).contains(&self.default_copies),
            "default copies {} outside [{}, {}]",
            self.default_copies,
            self.min_copies,
            self.max_copies
        );
        ensure!(self.max_parts >= 1, "max parts must be at least 1");
        ensure!(
            self.min_part_size <= self.max_part_size,
            "min part size {} exceeds max part size {}",
            self.min_part_size,
            self.max_part_size
        );
        ensure!(self.backend_retries >= 1, "backend retries must be at least 1");
        Ok(())
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Multipart upload gateway")]
pub struct Args {
    /// Host to bind to (overrides MPU_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MPU_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where part and object bytes are stored (overrides MPU_GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MPU_GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Comma-separated accounts to provision (overrides MPU_GATEWAY_ACCOUNTS)
    #[arg(long, value_delimiter = ',')]
    pub accounts: Option<Vec<String>>,

    /// Minimum part size for non-final parts in bytes (overrides MPU_GATEWAY_MIN_PART_SIZE)
    #[arg(long)]
    pub min_part_size: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("MPU_GATEWAY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_or("MPU_GATEWAY_PORT", 8080u16)?;
        let env_storage =
            env::var("MPU_GATEWAY_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_db = env::var("MPU_GATEWAY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/mpu.db".into());
        let env_accounts = env::var("MPU_GATEWAY_ACCOUNTS")
            .map(|raw| split_accounts(&raw))
            .unwrap_or_default();

        let defaults = UploadLimits::default();
        let limits = UploadLimits {
            min_copies: env_or("MPU_GATEWAY_MIN_COPIES", defaults.min_copies)?,
            max_copies: env_or("MPU_GATEWAY_MAX_COPIES", defaults.max_copies)?,
            default_copies: env_or("MPU_GATEWAY_DEFAULT_COPIES", defaults.default_copies)?,
            max_parts: env_or("MPU_GATEWAY_MAX_PARTS", defaults.max_parts)?,
            min_part_size: match args.min_part_size {
                Some(size) => size,
                None => env_or("MPU_GATEWAY_MIN_PART_SIZE", defaults.min_part_size)?,
            },
            max_part_size: env_or("MPU_GATEWAY_MAX_PART_SIZE", defaults.max_part_size)?,
            dir_entry_limit: env_or("MPU_GATEWAY_DIR_ENTRY_LIMIT", defaults.dir_entry_limit)?,
            backend_retries: env_or("MPU_GATEWAY_BACKEND_RETRIES", defaults.backend_retries)?,
        };
        limits.validate().context("validating upload limits")?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            accounts: args.accounts.unwrap_or(env_accounts),
            limits,
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an environment variable, falling back to `default` when unset.
fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

fn split_accounts(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_valid() {
        let limits = UploadLimits::default();
        limits.validate().unwrap();
        assert_eq!(limits.max_parts, 10_000);
        assert_eq!(limits.dir_entry_limit, 1_000_000);
    }

    #[test]
    fn default_copies_must_sit_inside_the_range() {
        let limits = UploadLimits {
            default_copies: 12,
            ..UploadLimits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn inverted_part_sizes_are_rejected() {
        let limits = UploadLimits {
            min_part_size: 10,
            max_part_size: 5,
            ..UploadLimits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn accounts_list_ignores_blanks() {
        assert_eq!(split_accounts(" alice, ,bob,"), vec!["alice", "bob"]);
    }
}
