//! Expiry of abandoned upload sessions.

use crate::events::{EventSink, UploadEvent};
use crate::lifecycle::{SessionManager, TeardownReason};
use filevault_core::CompletionState;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// States a session may idle in while waiting for the client.
const EXPIRABLE: [CompletionState; 2] = [CompletionState::Open, CompletionState::AwaitingStore];

/// Tears down sessions that made no progress within the TTL.
#[derive(Clone)]
pub struct SessionSweeper {
    sessions: SessionManager,
    events: Arc<dyn EventSink>,
    ttl: Duration,
}

impl SessionSweeper {
    pub fn new(sessions: SessionManager, events: Arc<dyn EventSink>, ttl: Duration) -> Self {
        Self {
            sessions,
            events,
            ttl,
        }
    }

    /// Expire every idle session whose last progress is older than `now - ttl`.
    /// Returns how many were torn down.
    ///
    /// A session that moved to `Reassembling` or accepted a chunk after being
    /// selected is left alone.
    pub async fn sweep_once(&self, now: OffsetDateTime) -> usize {
        let cutoff = now - self.ttl;
        let registry = self.sessions.registry();
        let stale = registry.stale_sessions(cutoff, &EXPIRABLE).await;

        let mut expired = 0;
        for session in stale {
            // Progress made since the listing keeps the session alive.
            if registry
                .expire_if_stale(&session.id, cutoff, &EXPIRABLE)
                .await
                .is_none()
            {
                continue;
            }
            if self
                .sessions
                .teardown(&session.id, TeardownReason::Expired)
                .await
                .is_none()
            {
                continue;
            }
            expired += 1;
            tracing::info!(
                upload_id = %session.id,
                owner_id = %session.owner_id,
                received = session.received.len(),
                total_chunks = session.total_chunks,
                "Upload session expired"
            );
            self.events.publish(UploadEvent::Failed {
                owner_id: session.owner_id.clone(),
                file_id: session.target_file_id,
                upload_session_id: session.id,
                file_name: session.file_name.clone(),
                reason: "upload session expired".to_string(),
                retryable: false,
            });
        }
        expired
    }

    /// Run [`sweep_once`](Self::sweep_once) every `interval` on a background task.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let expired = self.sweep_once(OffsetDateTime::now_utc()).await;
                if expired > 0 {
                    tracing::info!(expired, "Session sweep complete");
                }
            }
        })
    }
}
