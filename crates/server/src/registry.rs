//! In-process registry of live upload sessions.
//!
//! Every state transition goes through one exclusive section per call, so the
//! check-then-act sequences that decide who reassembles a session cannot
//! interleave. The section never awaits I/O.

use async_trait::async_trait;
use filevault_core::{ChunkHints, CompletionState, UploadId, UploadSession};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use time::OffsetDateTime;

/// Outcome of recording one chunk index against a session.
#[derive(Clone, Debug)]
pub enum ChunkProgress {
    /// The index is recorded and more chunks are outstanding, or another
    /// caller already completed the set.
    Partial { received: u64, total: u64 },
    /// This call made the set complete and moved the session to
    /// `Reassembling`. Exactly one caller per session observes this.
    Complete(UploadSession),
    /// The session stopped accepting chunks before this call.
    Closed(CompletionState),
}

/// Store of live upload sessions keyed by ID.
#[async_trait]
pub trait SessionRegistry: Send + Sync + 'static {
    /// Insert a new session. An existing entry with the same ID is replaced.
    async fn insert(&self, session: UploadSession);

    /// Snapshot of a session.
    async fn get(&self, id: &UploadId) -> Option<UploadSession>;

    /// Record `index` as received, apply first-wins hints, and claim
    /// reassembly when the set becomes complete. Returns `None` for an
    /// unknown session.
    async fn record_chunk(
        &self,
        id: &UploadId,
        index: u64,
        hints: &ChunkHints,
    ) -> Option<ChunkProgress>;

    /// Move a session from `expected` to `next`. Returns false if the
    /// session is gone or in any other state.
    async fn compare_and_set(
        &self,
        id: &UploadId,
        expected: CompletionState,
        next: CompletionState,
    ) -> bool;

    /// Move a session to `Failed` if it is still in one of `states` and has
    /// made no progress since `cutoff`. Returns the state it left.
    async fn expire_if_stale(
        &self,
        id: &UploadId,
        cutoff: OffsetDateTime,
        states: &[CompletionState],
    ) -> Option<CompletionState>;

    /// Remove a session, returning it if it was present.
    async fn remove(&self, id: &UploadId) -> Option<UploadSession>;

    /// Sessions in one of `states` with no progress since `cutoff`.
    async fn stale_sessions(
        &self,
        cutoff: OffsetDateTime,
        states: &[CompletionState],
    ) -> Vec<UploadSession>;

    async fn len(&self) -> usize;
}

/// Registry held entirely in process memory.
///
/// Sessions do not survive a restart; the binary purges leftover scratch
/// areas at startup to match.
#[derive(Default)]
pub struct InMemorySessionRegistry {
    sessions: Mutex<HashMap<UploadId, UploadSession>>,
}

impl InMemorySessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UploadId, UploadSession>> {
        self.sessions.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Session registry lock was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[async_trait]
impl SessionRegistry for InMemorySessionRegistry {
    async fn insert(&self, session: UploadSession) {
        self.lock().insert(session.id, session);
    }

    async fn get(&self, id: &UploadId) -> Option<UploadSession> {
        self.lock().get(id).cloned()
    }

    async fn record_chunk(
        &self,
        id: &UploadId,
        index: u64,
        hints: &ChunkHints,
    ) -> Option<ChunkProgress> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(id)?;

        if !session.state.accepts_chunks() {
            return Some(ChunkProgress::Closed(session.state));
        }

        session.received.insert(index);
        session.apply_hints(hints);
        session.updated_at = OffsetDateTime::now_utc();

        if session.is_complete() {
            session.state = CompletionState::Reassembling;
            return Some(ChunkProgress::Complete(session.clone()));
        }

        Some(ChunkProgress::Partial {
            received: session.received.len() as u64,
            total: session.total_chunks,
        })
    }

    async fn compare_and_set(
        &self,
        id: &UploadId,
        expected: CompletionState,
        next: CompletionState,
    ) -> bool {
        let mut sessions = self.lock();
        match sessions.get_mut(id) {
            Some(session) if session.state == expected => {
                session.state = next;
                session.updated_at = OffsetDateTime::now_utc();
                true
            }
            _ => false,
        }
    }

    async fn expire_if_stale(
        &self,
        id: &UploadId,
        cutoff: OffsetDateTime,
        states: &[CompletionState],
    ) -> Option<CompletionState> {
        let mut sessions = self.lock();
        let session = sessions.get_mut(id)?;
        if !states.contains(&session.state) || session.updated_at >= cutoff {
            return None;
        }
        let previous = session.state;
        session.state = CompletionState::Failed;
        session.updated_at = OffsetDateTime::now_utc();
        Some(previous)
    }

    async fn remove(&self, id: &UploadId) -> Option<UploadSession> {
        self.lock().remove(id)
    }

    async fn stale_sessions(
        &self,
        cutoff: OffsetDateTime,
        states: &[CompletionState],
    ) -> Vec<UploadSession> {
        self.lock()
            .values()
            .filter(|s| states.contains(&s.state) && s.updated_at < cutoff)
            .cloned()
            .collect()
    }

    async fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filevault_core::FileId;
    use std::sync::Arc;
    use time::Duration;

    fn session(size: u64, chunk: u64) -> UploadSession {
        UploadSession::new("owner", "a.bin", size, chunk)
    }

    #[tokio::test]
    async fn test_record_chunk_completes_once() {
        let registry = InMemorySessionRegistry::new();
        let s = session(30, 10);
        let id = s.id;
        registry.insert(s).await;

        let hints = ChunkHints::default();
        assert!(matches!(
            registry.record_chunk(&id, 2, &hints).await,
            Some(ChunkProgress::Partial {
                received: 1,
                total: 3
            })
        ));
        assert!(matches!(
            registry.record_chunk(&id, 0, &hints).await,
            Some(ChunkProgress::Partial { received: 2, .. })
        ));
        assert!(matches!(
            registry.record_chunk(&id, 1, &hints).await,
            Some(ChunkProgress::Complete(_))
        ));
        assert!(matches!(
            registry.record_chunk(&id, 1, &hints).await,
            Some(ChunkProgress::Closed(CompletionState::Reassembling))
        ));
    }

    #[tokio::test]
    async fn test_resent_index_does_not_complete_early() {
        let registry = InMemorySessionRegistry::new();
        let s = session(20, 10);
        let id = s.id;
        registry.insert(s).await;

        let hints = ChunkHints::default();
        registry.record_chunk(&id, 0, &hints).await;
        assert!(matches!(
            registry.record_chunk(&id, 0, &hints).await,
            Some(ChunkProgress::Partial { received: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_session_is_none() {
        let registry = InMemorySessionRegistry::new();
        assert!(
            registry
                .record_chunk(&UploadId::new(), 0, &ChunkHints::default())
                .await
                .is_none()
        );
        assert!(
            !registry
                .compare_and_set(
                    &UploadId::new(),
                    CompletionState::Open,
                    CompletionState::Failed
                )
                .await
        );
    }

    #[tokio::test]
    async fn test_hints_are_first_wins() {
        let registry = InMemorySessionRegistry::new();
        let s = session(20, 10);
        let id = s.id;
        registry.insert(s).await;

        let first = FileId::new();
        registry
            .record_chunk(
                &id,
                0,
                &ChunkHints {
                    file_id: Some(first),
                    ..ChunkHints::default()
                },
            )
            .await;
        let Some(ChunkProgress::Complete(done)) = registry
            .record_chunk(
                &id,
                1,
                &ChunkHints {
                    file_id: Some(FileId::new()),
                    ..ChunkHints::default()
                },
            )
            .await
        else {
            panic!("expected completion");
        };
        assert_eq!(done.target_file_id, Some(first));
    }

    #[tokio::test]
    async fn test_concurrent_final_chunks_claim_once() {
        let registry = Arc::new(InMemorySessionRegistry::new());
        let total = 64;
        let s = session(total * 10, 10);
        let id = s.id;
        registry.insert(s).await;

        let mut handles = Vec::new();
        for index in 0..total {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .record_chunk(&id, index, &ChunkHints::default())
                    .await
            }));
        }

        let mut completions = 0;
        for handle in handles {
            if let Some(ChunkProgress::Complete(_)) = handle.await.unwrap() {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn test_stale_sessions_filters_by_state_and_age() {
        let registry = InMemorySessionRegistry::new();
        let mut old = session(10, 10);
        old.updated_at -= Duration::hours(2);
        let mut busy = session(10, 10);
        busy.updated_at -= Duration::hours(2);
        busy.state = CompletionState::Reassembling;
        let fresh = session(10, 10);
        let old_id = old.id;
        registry.insert(old).await;
        registry.insert(busy).await;
        registry.insert(fresh).await;

        let cutoff = OffsetDateTime::now_utc() - Duration::hours(1);
        let stale = registry
            .stale_sessions(
                cutoff,
                &[CompletionState::Open, CompletionState::AwaitingStore],
            )
            .await;
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old_id);
        assert_eq!(registry.len().await, 3);
    }

    #[tokio::test]
    async fn test_expire_if_stale_rechecks_progress() {
        let registry = InMemorySessionRegistry::new();
        let mut s = session(20, 10);
        s.updated_at -= Duration::hours(2);
        let id = s.id;
        registry.insert(s).await;

        let cutoff = OffsetDateTime::now_utc() - Duration::hours(1);
        let states = [CompletionState::Open, CompletionState::AwaitingStore];
        assert_eq!(registry.stale_sessions(cutoff, &states).await.len(), 1);

        // A chunk lands after the stale listing but before expiry.
        registry.record_chunk(&id, 0, &ChunkHints::default()).await;
        assert_eq!(registry.expire_if_stale(&id, cutoff, &states).await, None);
        assert_eq!(
            registry.get(&id).await.unwrap().state,
            CompletionState::Open
        );

        let later = OffsetDateTime::now_utc() + Duration::hours(1);
        assert_eq!(
            registry.expire_if_stale(&id, later, &states).await,
            Some(CompletionState::Open)
        );
        assert_eq!(
            registry.get(&id).await.unwrap().state,
            CompletionState::Failed
        );
        assert_eq!(registry.expire_if_stale(&id, later, &states).await, None);
    }
}
