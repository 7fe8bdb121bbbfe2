//! Reload controller: the task that owns import scheduling.
//!
//! Triggers (signals, timers, admin requests) only ever call
//! [`ReloadHandle::reload`]; the loop turns them into importer runs one at a
//! time.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::importer::{ImportOutcome, Importer, ProgramFeed};

/// Answer to a reload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadRequest {
    /// A run will start once the loop is free.
    Queued,
    /// A run was already pending; this request merged into it.
    Coalesced,
    /// The loop has stopped.
    Closed,
}

/// Cloneable trigger for the reload loop.
///
/// The loop stops once every handle is dropped.
#[derive(Debug, Clone)]
#[allow(clippy::module_name_repetitions)]
pub struct ReloadHandle {
    tx: mpsc::Sender<()>,
}

impl ReloadHandle {
    /// Requests one import run.
    #[must_use = "the request may have been coalesced or rejected"]
    pub fn reload(&self) -> ReloadRequest {
        match self.tx.try_send(()) {
            Ok(()) => ReloadRequest::Queued,
            Err(mpsc::error::TrySendError::Full(())) => ReloadRequest::Coalesced,
            Err(mpsc::error::TrySendError::Closed(())) => ReloadRequest::Closed,
        }
    }
}

/// Spawns the reload loop on the current tokio runtime.
///
/// Runs an initial import when no generation is active, then one import per
/// reload request and, if `interval` is set, one per tick.
#[must_use]
pub fn spawn_reload_loop<F>(
    importer: Importer,
    feed: Arc<F>,
    interval: Option<Duration>,
) -> (ReloadHandle, JoinHandle<()>)
where
    F: ProgramFeed + Sync + 'static,
{
    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(reload_loop(importer, feed, interval, rx));
    (ReloadHandle { tx }, task)
}

async fn reload_loop<F>(
    importer: Importer,
    feed: Arc<F>,
    interval: Option<Duration>,
    mut rx: mpsc::Receiver<()>,
) where
    F: ProgramFeed + Sync + 'static,
{
    match importer.has_active_generation() {
        Ok(true) => {}
        Ok(false) => {
            tracing::info!("no active generation; running initial import");
            run_once(&importer, feed.as_ref(), "startup").await;
        }
        Err(e) => tracing::warn!(error = %format!("{e:#}"), "failed to read active generation"),
    }

    let mut ticker = interval.map(|period| {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.reset();
        ticker
    });

    loop {
        let trigger = tokio::select! {
            request = rx.recv() => match request {
                Some(()) => "reload",
                None => break,
            },
            _ = async {
                match ticker.as_mut() {
                    Some(t) => { t.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => "interval",
        };
        run_once(&importer, feed.as_ref(), trigger).await;
    }

    tracing::info!("reload loop stopped");
}

async fn run_once<F>(importer: &Importer, feed: &F, trigger: &'static str)
where
    F: ProgramFeed + Sync,
{
    match importer.run(feed).await {
        Ok(ImportOutcome::Completed(report)) => {
            tracing::debug!(trigger, version = report.version, "reload finished");
        }
        Ok(ImportOutcome::Coalesced) => {
            tracing::debug!(trigger, "reload coalesced with running import");
        }
        Err(e) => {
            // Already logged by the importer; the next trigger retries.
            tracing::debug!(trigger, error = %e, "reload failed");
        }
    }
}
