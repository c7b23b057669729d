use marct::sync::{SyncOutcome, Synchronizer};
use marct_config::shared::{SyncerConfig, SyncerConfigWithoutSecrets};
use tracing::{debug, info, warn};

/// Runs one synchronization with `config` and logs how it went.
pub async fn run_syncer(config: SyncerConfig) -> anyhow::Result<()> {
    info!("starting syncer");
    log_config(&config);

    let layout = config.layout.resolve();
    let synchronizer = Synchronizer::new(config.database, &layout, config.sync);

    let outcome = synchronizer.run().await?;
    log_outcome(&outcome);

    Ok(())
}

fn log_config(config: &SyncerConfig) {
    let SyncerConfigWithoutSecrets {
        database,
        layout,
        sync,
    } = config.clone().into();

    debug!(
        host = %database.host,
        port = database.port,
        dbname = %database.name,
        username = %database.username,
        tls_enabled = database.tls.enabled,
        "using database config"
    );
    debug!(profile = ?layout.profile, overrides = ?layout.overrides, "using layout config");
    debug!(
        force_full = sync.force_full,
        trigram_index = sync.trigram_index,
        consumer_accounts = ?sync.consumer_accounts,
        output_file = ?sync.output_file,
        incremental_deadline_secs = sync.incremental_deadline_secs,
        cursor_fetch_size = sync.cursor_fetch_size,
        "using sync config"
    );
}

fn log_outcome(outcome: &SyncOutcome) {
    match outcome {
        SyncOutcome::Incremental(summary) => info!(
            added = summary.added,
            deleted = summary.deleted,
            changed = summary.changed,
            retired = summary.retired,
            "projection updated incrementally"
        ),
        SyncOutcome::Full(summary) => info!(
            records_read = summary.records_read,
            rows_loaded = summary.rows_loaded,
            checksum_entries = summary.checksum_entries,
            "projection rebuilt"
        ),
        SyncOutcome::FullAfterFallback {
            summary,
            incremental_error,
        } => warn!(
            records_read = summary.records_read,
            rows_loaded = summary.rows_loaded,
            error = %incremental_error,
            "projection rebuilt after incremental update failed"
        ),
        SyncOutcome::File(summary) => info!(
            records_read = summary.records_read,
            rows_written = summary.rows_produced,
            "projection written to file"
        ),
    }
}
