use blobstore_migrate::{
    MigrateError, MigrateResult,
    config::{AppConfig, Command, Transport},
    models::{record::Mode, window::TransferWindow},
    services::{
        checkpoint::CheckpointStore,
        ledger::Ledger,
        record_migration::RecordMigration,
        record_source::{RecordFilter, RecordSource},
        sync::{SyncOptions, run_sync},
        transfer::{TransferEngine, TransferSettings},
        transporter::{CommandTransporter, LargeObjectTransporter, MultipartTransporter},
        verify::Verifier,
    },
    stores::{
        DocumentStore, ObjectStore, fs_objects::FsObjectStore,
        sqlite_documents::SqliteDocumentStore,
    },
};
use chrono::{DateTime, Utc};
use std::{process::ExitCode, sync::Arc};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config + command ---
    let (cfg, command) = match AppConfig::from_env_and_args() {
        Ok(parsed) => parsed,
        Err(err) => {
            eprintln!("Error: {:#}", err);
            return ExitCode::from(2);
        }
    };

    tracing::info!("Starting blobstore-migrate with config: {:?}", cfg);

    match run(&cfg, command).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{}", err.format_detailed());
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(cfg: &AppConfig, command: Command) -> MigrateResult<ExitCode> {
    match command {
        Command::Sync {
            mode,
            start_date,
            end_date,
            reset_ledger,
            dry_run,
        } => {
            let options = SyncOptions {
                mode,
                start: start_date,
                end: end_date,
                reset_ledger,
                filter: RecordFilter::for_mode(mode, cfg.reserved_owner.as_deref()),
            };
            sync(cfg, options, dry_run).await
        }
        Command::Verify {
            mode,
            start_date,
            end_date,
            check_records,
        } => verify(cfg, mode, start_date, end_date, check_records).await,
        Command::MigrateRecords {
            mode,
            start_date,
            end_date,
        } => migrate_records(cfg, mode, start_date, end_date).await,
    }
}

async fn open_records(url: &str) -> MigrateResult<Arc<dyn DocumentStore>> {
    Ok(Arc::new(SqliteDocumentStore::open(url).await?))
}

async fn open_source_objects(cfg: &AppConfig) -> MigrateResult<Arc<dyn ObjectStore>> {
    Ok(Arc::new(
        FsObjectStore::open(&cfg.source_db_url, &cfg.source_root, &cfg.source_bucket).await?,
    ))
}

async fn open_destination_objects(cfg: &AppConfig) -> MigrateResult<Arc<dyn ObjectStore>> {
    Ok(Arc::new(
        FsObjectStore::open(
            &cfg.destination_db_url,
            &cfg.destination_root,
            &cfg.destination_bucket,
        )
        .await?,
    ))
}

fn transporter(cfg: &AppConfig) -> MigrateResult<Arc<dyn LargeObjectTransporter>> {
    match cfg.transport {
        Transport::Multipart => Ok(Arc::new(MultipartTransporter::new(
            &cfg.scratch_dir,
            cfg.part_size,
        ))),
        Transport::Command => {
            let command = cfg.copy_command.as_deref().ok_or_else(|| {
                MigrateError::Config("the command transport needs a copy command".into())
            })?;
            Ok(Arc::new(CommandTransporter::from_command_line(
                &cfg.scratch_dir,
                command,
            )?))
        }
    }
}

fn window(
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> MigrateResult<TransferWindow> {
    let unbounded = TransferWindow::unbounded();
    TransferWindow::new(
        start.unwrap_or(unbounded.start()),
        end.unwrap_or_else(Utc::now),
    )
}

async fn sync(cfg: &AppConfig, options: SyncOptions, dry_run: bool) -> MigrateResult<ExitCode> {
    let mode = options.mode;
    let state_dir = cfg.state_dir.join(mode.as_str());
    let records = RecordSource::new(open_records(&cfg.records_url).await?, cfg.batch_size);
    let ledger = Arc::new(Ledger::open(&state_dir).await?);
    let checkpoint = CheckpointStore::in_dir(&state_dir);

    let settings = TransferSettings {
        workers: cfg.workers,
        large_object_threshold: cfg.large_object_threshold,
        dry_run,
        ..TransferSettings::new(mode.source_layout(), mode.destination_layout())
    };
    let engine = TransferEngine::new(
        open_source_objects(cfg).await?,
        open_destination_objects(cfg).await?,
        ledger.clone(),
        transporter(cfg)?,
        settings,
    );

    let result = run_sync(&records, &engine, &checkpoint, options, Utc::now()).await;

    // printed on failure too, so a partial pass is still accounted for
    eprintln!("transfer: {}", engine.summary());
    eprintln!("records: {}", records.stats());
    let counts = ledger.counts().await;
    eprintln!("ledger: done={} pending_retry={}", counts.done, counts.pending_retry);

    result?;
    Ok(ExitCode::SUCCESS)
}

async fn verify(
    cfg: &AppConfig,
    mode: Mode,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    check_records: bool,
) -> MigrateResult<ExitCode> {
    let window = window(start, end)?;
    let records = RecordSource::new(open_records(&cfg.records_url).await?, cfg.batch_size);
    let mut verifier = Verifier::new(mode, open_destination_objects(cfg).await?, cfg.workers);
    if check_records {
        verifier = verifier.with_target_records(open_records(&cfg.target_records_url).await?);
    }

    let collection = mode.verify_collection(check_records);
    let total = records.count(collection, window).await?;
    tracing::info!("verifying up to {} {} records in {}", total, collection, window);

    let filter = RecordFilter::for_mode(mode, cfg.reserved_owner.as_deref());
    let candidates = records.verification_records(mode, window, filter, check_records);
    let result = verifier.run(candidates).await;

    let summary = verifier.summary();
    eprintln!("verify: {}", summary);
    eprintln!("records: {}", records.stats());

    result?;
    if summary.has_problems() {
        return Ok(ExitCode::from(3));
    }
    Ok(ExitCode::SUCCESS)
}

async fn migrate_records(
    cfg: &AppConfig,
    mode: Mode,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> MigrateResult<ExitCode> {
    let window = window(start, end)?;
    let migration = RecordMigration::new(
        open_records(&cfg.records_url).await?,
        open_records(&cfg.target_records_url).await?,
        cfg.batch_size,
    );
    let filter = RecordFilter::for_mode(mode, cfg.reserved_owner.as_deref());

    let report = migration.run(mode, window, filter).await?;
    eprintln!("migrate-records: {}", report);
    eprintln!("records: {}", migration.source().stats());
    Ok(ExitCode::SUCCESS)
}
