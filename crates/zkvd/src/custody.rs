//! Custodian lifecycle: load epochs, keys and enrollments, then republish.

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use zkv_core::config::ZkvConfig;
use zkv_core::{Clock, SystemClock};
use zkv_custody::{
    load_enrollments, needs_rewrap, Custodian, CustodianKeys, EpochTable, RepublishScheduler,
};
use zkv_sync::{build_operator, ObjectStoreNamingLayer, SequenceCache, SyncCoordinator};

struct Loaded {
    custodian: Arc<Custodian>,
    cache: Option<SequenceCache>,
}

impl Loaded {
    fn flush(&self) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.flush() {
                warn!("failed to persist sequence cache: {e}");
            }
        }
    }

    fn save(&self, config: &ZkvConfig) -> Result<()> {
        self.custodian
            .table()
            .save(&config.daemon.epoch_file)
            .context("saving epoch table")?;
        self.custodian
            .save_keys(&config.daemon.custodian_key_file)
            .context("saving custodian keys")?;
        Ok(())
    }
}

fn load(config: &ZkvConfig) -> Result<Loaded> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let op = build_operator(&config.storage).context("building storage operator")?;
    // The layer appends `names/` itself; owners publish under the same prefix.
    let naming = Arc::new(ObjectStoreNamingLayer::new(op, config.storage.prefix.clone()));

    let mut coordinator = SyncCoordinator::new(naming, &config.naming, clock.clone());
    let cache = match &config.naming.sequence_cache {
        Some(path) => {
            let cache = SequenceCache::open(path).context("opening sequence cache")?;
            coordinator = coordinator.with_tracker(cache.tracker());
            Some(cache)
        }
        None => None,
    };

    let table = EpochTable::load(&config.daemon.epoch_file, &config.custody, clock)
        .context("loading epoch table")?;
    let keys = CustodianKeys::load(&config.daemon.custodian_key_file)
        .context("loading custodian keys")?;
    info!(
        epochs = table.len(),
        keys = keys.len(),
        backend = %config.storage.backend,
        "custodian state loaded"
    );

    Ok(Loaded {
        custodian: Arc::new(Custodian::new(Arc::new(table), keys, Arc::new(coordinator))),
        cache,
    })
}

fn scheduler(config: &ZkvConfig, loaded: &Loaded) -> Result<RepublishScheduler> {
    let enrollments =
        load_enrollments(&config.daemon.enrollments_dir).context("loading enrollments")?;
    if enrollments.is_empty() {
        warn!(dir = %config.daemon.enrollments_dir.display(), "no enrollments found");
    }
    Ok(RepublishScheduler::new(
        loaded.custodian.clone(),
        loaded.custodian.table().clone(),
        enrollments,
        &config.custody,
    ))
}

pub async fn run(config: ZkvConfig) -> Result<()> {
    let loaded = load(&config)?;
    let table = loaded.custodian.table();
    if table.active().is_err() {
        warn!("no active custodian epoch; owners cannot enroll until `zkvd rotate-epoch`");
    } else if table.rotation_due(config.custody.rotation_lead_secs) {
        warn!("custodian epoch rotation is due; run `zkvd rotate-epoch`");
    }
    let scheduler = Arc::new(scheduler(&config, &loaded)?);

    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        async move { scheduler.run(cancel).await }
    });

    shutdown_signal().await?;
    cancel.cancel();
    task.await.context("republish scheduler panicked")?;

    loaded.flush();
    // Retired epoch keys must stay destroyed on disk too.
    loaded.save(&config)?;
    info!("zkvd exiting cleanly");
    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("received ctrl-c");
    Ok(())
}

pub async fn cycle_once(config: ZkvConfig) -> Result<()> {
    let loaded = load(&config)?;
    let report = scheduler(&config, &loaded)?.run_cycle().await;
    loaded.flush();
    loaded.save(&config)?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    if !report.is_clean() {
        anyhow::bail!(
            "{} failed, {} expired",
            report.failed.len(),
            report.expired.len()
        );
    }
    Ok(())
}

pub fn rotate_epoch(config: ZkvConfig) -> Result<()> {
    let loaded = load(&config)?;
    let epoch = loaded.custodian.rotate();
    loaded.save(&config)?;
    println!(
        "epoch {} active until {} (public key {})",
        epoch.id,
        epoch.valid_until,
        epoch.public_key.to_hex()
    );
    Ok(())
}

pub fn status(config: ZkvConfig) -> Result<()> {
    print!("{}", describe(&config)?);
    Ok(())
}

fn describe(config: &ZkvConfig) -> Result<String> {
    let loaded = load(config)?;
    let table = loaded.custodian.table();
    let mut out = String::new();

    writeln!(
        out,
        "rotation due: {}",
        if table.rotation_due(config.custody.rotation_lead_secs) { "yes" } else { "no" }
    )?;
    writeln!(out, "epochs:")?;
    if table.is_empty() {
        writeln!(out, "  (none)")?;
    }
    for (epoch, state) in table.epochs() {
        writeln!(
            out,
            "  {:>4}  {:<10}  valid_until={}  grace_until={}",
            epoch.id, state, epoch.valid_until, epoch.grace_until
        )?;
    }

    let enrollments =
        load_enrollments(&config.daemon.enrollments_dir).context("loading enrollments")?;
    writeln!(out, "enrollments: {}", enrollments.len())?;
    for enrollment in &enrollments {
        let state = table
            .state_of(enrollment.epoch_id)
            .map(|s| s.to_string())
            .unwrap_or_else(|_| "unknown".into());
        let rewrap = matches!(needs_rewrap(table, enrollment), Ok(true));
        writeln!(
            out,
            "  {}  epoch={} ({state}){}",
            enrollment.entity.fingerprint(),
            enrollment.epoch_id,
            if rewrap { "  needs re-wrap" } else { "" }
        )?;
    }
    Ok(out)
}
