//! Orphan-object sweeper
//!
//! PutObject records a write intent before the payload lands and clears
//! it after metadata commits. A stale intent therefore means the write
//! died in between: if the artifact metadata exists the write actually
//! completed and only the intent is dropped; otherwise the payload is
//! an invisible orphan and is deleted from the backend. The sweep is
//! idempotent and runs periodically alongside the multipart idle
//! reaper.

use crate::ObjectEngine;
use chrono::{Duration as ChronoDuration, Utc};
use depot_common::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Intents younger than this are left alone: their writer may still be
/// running.
const INTENT_GRACE_SECS: i64 = 60;

/// Outcome of one sweep pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub orphans_deleted: usize,
    pub intents_cleared: usize,
    pub sessions_reaped: usize,
}

impl ObjectEngine {
    /// One idempotent sweep pass
    pub async fn sweep(&self, token: &CancellationToken) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        let cutoff = Utc::now() - ChronoDuration::seconds(INTENT_GRACE_SECS);

        for intent in self.meta().list_intents()? {
            if intent.started_at > cutoff {
                continue;
            }

            let committed = self
                .meta()
                .get_artifact(&intent.bucket, &intent.key)?
                .is_some_and(|artifact| artifact.storage_path == intent.storage_path);

            if committed {
                // The write finished; only the intent is stale
                self.meta().delete_intent(&intent.bucket, &intent.key)?;
                report.intents_cleared += 1;
                debug!(bucket = %intent.bucket, key = %intent.key, "cleared stale intent for committed object");
                continue;
            }

            match self
                .backend()
                .delete_object(token, &intent.bucket, &intent.key)
                .await
            {
                Ok(()) => {
                    self.meta().delete_intent(&intent.bucket, &intent.key)?;
                    report.orphans_deleted += 1;
                    info!(bucket = %intent.bucket, key = %intent.key, "deleted orphaned payload");
                }
                Err(err) => {
                    // Keep the intent; the next sweep retries
                    warn!(bucket = %intent.bucket, key = %intent.key, error = %err, "orphan delete failed");
                }
            }
        }

        report.sessions_reaped = self.reap_idle_sessions(token).await?;
        Ok(report)
    }
}

/// Spawn the periodic sweeper. The task stops when the token fires.
pub fn spawn_sweeper(
    engine: Arc<ObjectEngine>,
    interval: Duration,
    token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {}
            }
            match engine.sweep(&token).await {
                Ok(report) if report != SweepReport::default() => {
                    info!(
                        orphans = report.orphans_deleted,
                        intents = report.intents_cleared,
                        sessions = report.sessions_reaped,
                        "sweep pass finished"
                    );
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "sweep pass failed"),
            }
        }
    })
}
