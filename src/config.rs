use crate::models::record::Mode;
use crate::services::{
    record_source::DEFAULT_BATCH_SIZE, transfer::DEFAULT_LARGE_OBJECT_THRESHOLD,
    transporter::DEFAULT_PART_SIZE,
};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use std::{env, path::PathBuf, str::FromStr};

const ENV_PREFIX: &str = "BLOBSTORE_MIGRATE_";
const MAX_WORKERS: usize = 256;

/// How objects above the large-object threshold are copied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Transport {
    /// Multipart upload through the destination store.
    Multipart,
    /// External copy command run on a scratch copy.
    Command,
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Record store the candidates are read from.
    pub records_url: String,
    /// Record store converted records are written to and checked against.
    pub target_records_url: String,
    pub source_root: PathBuf,
    pub source_db_url: String,
    pub source_bucket: String,
    pub destination_root: PathBuf,
    pub destination_db_url: String,
    pub destination_bucket: String,
    /// Ledger and checkpoint directory.
    pub state_dir: PathBuf,
    pub workers: usize,
    pub batch_size: usize,
    pub large_object_threshold: u64,
    pub scratch_dir: PathBuf,
    pub transport: Transport,
    pub copy_command: Option<String>,
    pub part_size: usize,
    /// Owner id whose legacy nodes belong to the workspace and are skipped.
    pub reserved_owner: Option<String>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Copy objects referenced by records in the window to the destination
    Sync {
        #[arg(long, value_enum)]
        mode: Mode,
        /// Window start, RFC 3339 or YYYY-MM-DD (default: checkpoint)
        #[arg(long, value_parser = parse_date)]
        start_date: Option<DateTime<Utc>>,
        /// Window end, RFC 3339 or YYYY-MM-DD (default: now)
        #[arg(long, value_parser = parse_date)]
        end_date: Option<DateTime<Utc>>,
        /// Forget completed identifiers before the pass
        #[arg(long)]
        reset_ledger: bool,
        /// Report what would be copied without writing anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Check that every record in the window has a matching object
    Verify {
        #[arg(long, value_enum)]
        mode: Mode,
        #[arg(long, value_parser = parse_date)]
        start_date: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_date)]
        end_date: Option<DateTime<Utc>>,
        /// Also require a counterpart in the target record store
        #[arg(long)]
        check_records: bool,
    },
    /// Convert legacy records into the target record store
    MigrateRecords {
        #[arg(long, value_enum)]
        mode: Mode,
        #[arg(long, value_parser = parse_date)]
        start_date: Option<DateTime<Utc>>,
        #[arg(long, value_parser = parse_date)]
        end_date: Option<DateTime<Utc>>,
    },
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Incremental blob migration and verification")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Record store URL (overrides BLOBSTORE_MIGRATE_RECORDS_URL)
    #[arg(long, global = true)]
    pub records_url: Option<String>,

    /// Target record store URL (overrides BLOBSTORE_MIGRATE_TARGET_RECORDS_URL)
    #[arg(long, global = true)]
    pub target_records_url: Option<String>,

    /// Source object root (overrides BLOBSTORE_MIGRATE_SOURCE_ROOT)
    #[arg(long, global = true)]
    pub source_root: Option<PathBuf>,

    /// Source object metadata URL (overrides BLOBSTORE_MIGRATE_SOURCE_DB_URL)
    #[arg(long, global = true)]
    pub source_db_url: Option<String>,

    /// Source bucket (overrides BLOBSTORE_MIGRATE_SOURCE_BUCKET)
    #[arg(long, global = true)]
    pub source_bucket: Option<String>,

    /// Destination object root (overrides BLOBSTORE_MIGRATE_DESTINATION_ROOT)
    #[arg(long, global = true)]
    pub destination_root: Option<PathBuf>,

    /// Destination object metadata URL (overrides BLOBSTORE_MIGRATE_DESTINATION_DB_URL)
    #[arg(long, global = true)]
    pub destination_db_url: Option<String>,

    /// Destination bucket (overrides BLOBSTORE_MIGRATE_DESTINATION_BUCKET)
    #[arg(long, global = true)]
    pub destination_bucket: Option<String>,

    /// Ledger and checkpoint directory (overrides BLOBSTORE_MIGRATE_STATE_DIR)
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    /// Concurrent workers (overrides BLOBSTORE_MIGRATE_WORKERS)
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Records per round trip (overrides BLOBSTORE_MIGRATE_BATCH_SIZE)
    #[arg(long, global = true)]
    pub batch_size: Option<usize>,

    /// Size in bytes above which the large-object transport is used
    #[arg(long, global = true)]
    pub large_object_threshold: Option<u64>,

    /// Scratch directory for large objects (overrides BLOBSTORE_MIGRATE_SCRATCH_DIR)
    #[arg(long, global = true)]
    pub scratch_dir: Option<PathBuf>,

    /// Large-object transport (overrides BLOBSTORE_MIGRATE_TRANSPORT)
    #[arg(long, global = true, value_enum)]
    pub transport: Option<Transport>,

    /// Copy command for the command transport; `{src}` and `{key}` are substituted
    #[arg(long, global = true)]
    pub copy_command: Option<String>,

    /// Multipart part size in bytes (overrides BLOBSTORE_MIGRATE_PART_SIZE)
    #[arg(long, global = true)]
    pub part_size: Option<usize>,

    /// Owner id excluded from legacy node scans (overrides BLOBSTORE_MIGRATE_RESERVED_OWNER)
    #[arg(long, global = true)]
    pub reserved_owner: Option<String>,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        let args = Args::parse();
        let command = args.command.clone();
        Ok((Self::merge(args)?, command))
    }

    /// Apply CLI overrides on top of environment values and defaults.
    pub fn merge(args: Args) -> Result<Self> {
        let transport = match args.transport {
            Some(transport) => transport,
            None => match env_opt("TRANSPORT")? {
                Some(value) => <Transport as ValueEnum>::from_str(&value, true)
                    .map_err(|err| anyhow::anyhow!("parsing {ENV_PREFIX}TRANSPORT: {err}"))?,
                None => Transport::Multipart,
            },
        };

        let cfg = Self {
            records_url: args
                .records_url
                .unwrap_or(env_or("RECORDS_URL", "sqlite://./data/records.db")?),
            target_records_url: args
                .target_records_url
                .unwrap_or(env_or("TARGET_RECORDS_URL", "sqlite://./data/target_records.db")?),
            source_root: args
                .source_root
                .unwrap_or(PathBuf::from(env_or("SOURCE_ROOT", "./data/source")?)),
            source_db_url: args
                .source_db_url
                .unwrap_or(env_or("SOURCE_DB_URL", "sqlite://./data/source/objects.db")?),
            source_bucket: args
                .source_bucket
                .unwrap_or(env_or("SOURCE_BUCKET", "shock")?),
            destination_root: args
                .destination_root
                .unwrap_or(PathBuf::from(env_or("DESTINATION_ROOT", "./data/destination")?)),
            destination_db_url: args.destination_db_url.unwrap_or(env_or(
                "DESTINATION_DB_URL",
                "sqlite://./data/destination/objects.db",
            )?),
            destination_bucket: args
                .destination_bucket
                .unwrap_or(env_or("DESTINATION_BUCKET", "blobstore")?),
            state_dir: args
                .state_dir
                .unwrap_or(PathBuf::from(env_or("STATE_DIR", "./data/state")?)),
            workers: match args.workers {
                Some(workers) => workers,
                None => env_parse("WORKERS", 10)?,
            },
            batch_size: match args.batch_size {
                Some(size) => size,
                None => env_parse("BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            },
            large_object_threshold: match args.large_object_threshold {
                Some(threshold) => threshold,
                None => env_parse("LARGE_OBJECT_THRESHOLD", DEFAULT_LARGE_OBJECT_THRESHOLD)?,
            },
            scratch_dir: args
                .scratch_dir
                .unwrap_or(PathBuf::from(env_or("SCRATCH_DIR", "./data/scratch")?)),
            transport,
            copy_command: args.copy_command.or(env_opt("COPY_COMMAND")?),
            part_size: match args.part_size {
                Some(size) => size,
                None => env_parse("PART_SIZE", DEFAULT_PART_SIZE)?,
            },
            reserved_owner: args.reserved_owner.or(env_opt("RESERVED_OWNER")?),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            bail!("workers must be between 1 and {}, got {}", MAX_WORKERS, self.workers);
        }
        if self.batch_size == 0 {
            bail!("batch size must be positive");
        }
        if self.part_size == 0 {
            bail!("part size must be positive");
        }
        if self.transport == Transport::Command && self.copy_command.is_none() {
            bail!("the command transport needs a copy command");
        }
        Ok(())
    }
}

fn env_opt(name: &str) -> Result<Option<String>> {
    let key = format!("{ENV_PREFIX}{name}");
    match env::var(&key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

fn env_or(name: &str, default: &str) -> Result<String> {
    Ok(env_opt(name)?.unwrap_or_else(|| default.to_string()))
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_opt(name)? {
        Some(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {}{} value `{}`", ENV_PREFIX, name, value)),
        None => Ok(default),
    }
}

/// RFC 3339, a naive `YYYY-MM-DDTHH:MM:SS[.f]` (UTC) or a bare date (midnight UTC).
pub fn parse_date(value: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(naive.and_utc());
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(format!(
        "`{}` is not an RFC 3339 timestamp or YYYY-MM-DD date",
        value
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn dates_accept_all_three_forms() {
        let midnight = Utc.with_ymd_and_hms(2020, 8, 12, 0, 0, 0).unwrap();
        assert_eq!(parse_date("2020-08-12").unwrap(), midnight);
        assert_eq!(parse_date("2020-08-12T00:00:00Z").unwrap(), midnight);
        assert_eq!(parse_date("2020-08-12T02:00:00+02:00").unwrap(), midnight);
        assert_eq!(parse_date("2020-08-12T00:00:00.000").unwrap(), midnight);
        assert!(parse_date("last tuesday").is_err());
    }

    #[test]
    fn cli_overrides_apply() {
        let args = Args::try_parse_from([
            "blobstore-migrate",
            "sync",
            "--mode",
            "shock",
            "--workers",
            "4",
            "--state-dir",
            "/tmp/state",
            "--start-date",
            "2020-08-12",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Command::Sync {
                mode: Mode::Shock,
                start_date: Some(_),
                ..
            }
        ));
        let cfg = AppConfig::merge(args).unwrap();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.state_dir, PathBuf::from("/tmp/state"));
    }

    #[test]
    fn zero_workers_are_rejected() {
        let args = Args::try_parse_from([
            "blobstore-migrate",
            "verify",
            "--mode",
            "blobstore",
            "--workers",
            "0",
        ])
        .unwrap();
        assert!(AppConfig::merge(args).is_err());
    }
}
