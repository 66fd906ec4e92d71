//! Chunk receipt and upload completion.
//!
//! A chunk is written to scratch before its index is recorded, so a session
//! only counts as complete once every blob it needs is on disk. The registry
//! hands the completing call, and only that call, the job of reassembling,
//! storing and recording the file.

use crate::events::{EventSink, UploadEvent};
use crate::lifecycle::{SessionManager, TeardownReason};
use crate::metrics::{
    BYTES_RECEIVED, CHUNK_RECEIVE_DURATION, CHUNK_RESENDS, CHUNKS_RECEIVED, OBJECTS_STORED,
    REASSEMBLY_DURATION,
};
use crate::reassembly::ReassemblyEngine;
use crate::registry::ChunkProgress;
use bytes::Bytes;
use filevault_core::upload::ChunkAck;
use filevault_core::{ChunkHints, CompletionState, Error, Result, UploadId, UploadSession};
use filevault_metadata::{MetadataStore, NewFileRecord};
use filevault_storage::ObjectStoreGateway;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::io::ReaderStream;

/// One chunk as received from a client.
#[derive(Clone, Debug)]
pub struct IncomingChunk {
    pub upload_id: UploadId,
    pub chunk_index: u64,
    pub total_chunks: u64,
    pub hints: ChunkHints,
    pub data: Bytes,
}

/// Result of a client abort request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortOutcome {
    Aborted,
    /// Nothing to abort: unknown, already finished, or owned by someone else.
    NotFound,
    /// The session is being reassembled and cannot be stopped.
    Busy,
}

/// Drives sessions from chunk arrival to a recorded file version.
#[derive(Clone)]
pub struct ChunkReceiver {
    sessions: SessionManager,
    engine: ReassemblyEngine,
    gateway: ObjectStoreGateway,
    metadata: Arc<dyn MetadataStore>,
    events: Arc<dyn EventSink>,
}

impl ChunkReceiver {
    pub fn new(
        sessions: SessionManager,
        gateway: ObjectStoreGateway,
        metadata: Arc<dyn MetadataStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let engine = ReassemblyEngine::new(sessions.chunks().clone());
        Self {
            sessions,
            engine,
            gateway,
            metadata,
            events,
        }
    }

    /// Snapshot of a session owned by `owner_id`.
    ///
    /// Sessions owned by another caller are reported as unknown.
    pub async fn session_for(&self, owner_id: &str, id: &UploadId) -> Result<UploadSession> {
        match self.sessions.registry().get(id).await {
            Some(session) if session.owner_id == owner_id => Ok(session),
            _ => Err(Error::UnknownSession(id.to_string())),
        }
    }

    /// Accept one chunk. Returns the completion ack if this chunk finished
    /// the file, a partial ack otherwise.
    #[tracing::instrument(
        skip(self, chunk),
        fields(upload_id = %chunk.upload_id, chunk_index = chunk.chunk_index, size = chunk.data.len())
    )]
    pub async fn receive_chunk(&self, owner_id: &str, chunk: IncomingChunk) -> Result<ChunkAck> {
        let start = Instant::now();
        let id = chunk.upload_id;
        let session = self.session_for(owner_id, &id).await?;
        session.validate_chunk(chunk.chunk_index, chunk.total_chunks, chunk.data.len() as u64)?;

        if !session.state.accepts_chunks() {
            tracing::debug!(state = %session.state, "Chunk arrived after session closed");
            return Ok(ChunkAck::partial(chunk.chunk_index));
        }

        // New versions may only be added to a file the caller currently holds.
        if let Some(file_id) = chunk.hints.file_id
            && session.target_file_id.is_none()
            && self.metadata.get_latest(owner_id, &file_id).await?.is_none()
        {
            return Err(Error::InvalidRequest(format!(
                "file {file_id} does not exist for the caller"
            )));
        }

        if let Err(e) = self
            .sessions
            .chunks()
            .write_chunk(&id, chunk.chunk_index, &chunk.data)
            .await
        {
            if e.is_not_found() {
                return Err(Error::UnknownSession(id.to_string()));
            }
            let err = Error::IoFailure(format!("writing chunk {}: {e}", chunk.chunk_index));
            if self
                .sessions
                .registry()
                .compare_and_set(&id, CompletionState::Open, CompletionState::Failed)
                .await
            {
                self.fail(&session, &err).await;
            }
            return Err(err);
        }

        if session.received.contains(&chunk.chunk_index) {
            CHUNK_RESENDS.inc();
        }
        CHUNKS_RECEIVED.inc();
        BYTES_RECEIVED.inc_by(chunk.data.len() as u64);

        let progress = self
            .sessions
            .registry()
            .record_chunk(&id, chunk.chunk_index, &chunk.hints)
            .await;
        CHUNK_RECEIVE_DURATION.observe(start.elapsed().as_secs_f64());

        match progress {
            None => Err(Error::UnknownSession(id.to_string())),
            Some(ChunkProgress::Partial { received, total }) => {
                tracing::debug!(received, total, "Chunk recorded");
                Ok(ChunkAck::partial(chunk.chunk_index))
            }
            Some(ChunkProgress::Closed(state)) => {
                tracing::debug!(state = %state, "Chunk recorded after session closed");
                Ok(ChunkAck::partial(chunk.chunk_index))
            }
            Some(ChunkProgress::Complete(session)) => self.finish_upload(session).await,
        }
    }

    /// Re-run the storage step for a session whose earlier attempt found the
    /// object store unavailable.
    #[tracing::instrument(skip(self), fields(upload_id = %id))]
    pub async fn retry_completion(&self, owner_id: &str, id: &UploadId) -> Result<ChunkAck> {
        let session = self.session_for(owner_id, id).await?;
        if session.state != CompletionState::AwaitingStore {
            return Err(Error::InvalidRequest(format!(
                "session is {}, not awaiting storage",
                session.state
            )));
        }
        if !self
            .sessions
            .registry()
            .compare_and_set(
                id,
                CompletionState::AwaitingStore,
                CompletionState::Reassembling,
            )
            .await
        {
            return Err(Error::InvalidRequest(
                "session completion is already being retried".to_string(),
            ));
        }
        tracing::info!("Retrying upload completion");
        self.store_assembled(&session).await
    }

    /// Abort a session on the client's request.
    #[tracing::instrument(skip(self), fields(upload_id = %id))]
    pub async fn abort(&self, owner_id: &str, id: &UploadId) -> AbortOutcome {
        let Ok(session) = self.session_for(owner_id, id).await else {
            return AbortOutcome::NotFound;
        };
        let registry = self.sessions.registry();
        for from in [CompletionState::Open, CompletionState::AwaitingStore] {
            if registry
                .compare_and_set(id, from, CompletionState::Failed)
                .await
            {
                self.close(
                    &session,
                    TeardownReason::Aborted,
                    "upload aborted by client".to_string(),
                )
                .await;
                return AbortOutcome::Aborted;
            }
        }
        match registry.get(id).await.map(|s| s.state) {
            Some(CompletionState::Reassembling) => AbortOutcome::Busy,
            _ => AbortOutcome::NotFound,
        }
    }

    async fn finish_upload(&self, session: UploadSession) -> Result<ChunkAck> {
        let timer = REASSEMBLY_DURATION.start_timer();
        if let Err(e) = self.engine.reassemble(&session).await {
            self.sessions
                .registry()
                .compare_and_set(
                    &session.id,
                    CompletionState::Reassembling,
                    CompletionState::Failed,
                )
                .await;
            self.fail(&session, &e).await;
            return Err(e);
        }
        let outcome = self.store_assembled(&session).await;
        timer.observe_duration();
        outcome
    }

    /// Stream the assembled file to the object store and record the version.
    /// The session must be in `Reassembling`.
    async fn store_assembled(&self, session: &UploadSession) -> Result<ChunkAck> {
        let id = &session.id;
        let registry = self.sessions.registry();

        let (file, len) = match self.sessions.chunks().open_assembly(id).await {
            Ok(opened) => opened,
            Err(e) => {
                let err = Error::IoFailure(format!("opening assembled file: {e}"));
                registry
                    .compare_and_set(id, CompletionState::Reassembling, CompletionState::Failed)
                    .await;
                self.fail(session, &err).await;
                return Err(err);
            }
        };
        tracing::debug!(upload_id = %id, size = len, "Uploading assembled file");

        let stored = match self
            .gateway
            .upload(
                ReaderStream::new(file),
                session.target_file_id,
                &session.file_name,
                session.effective_content_type(),
            )
            .await
        {
            Ok(stored) => stored,
            Err(err) if err.is_retryable() => {
                registry
                    .compare_and_set(
                        id,
                        CompletionState::Reassembling,
                        CompletionState::AwaitingStore,
                    )
                    .await;
                tracing::warn!(
                    upload_id = %id,
                    error = %err,
                    "Object store unavailable, keeping assembled file for retry"
                );
                self.events.publish(UploadEvent::Failed {
                    owner_id: session.owner_id.clone(),
                    file_id: session.target_file_id,
                    upload_session_id: *id,
                    file_name: session.file_name.clone(),
                    reason: err.to_string(),
                    retryable: true,
                });
                return Err(err);
            }
            Err(err) => {
                registry
                    .compare_and_set(id, CompletionState::Reassembling, CompletionState::Failed)
                    .await;
                self.fail(session, &err).await;
                return Err(err);
            }
        };
        OBJECTS_STORED.inc();

        let record = NewFileRecord {
            file_id: stored.object_id,
            owner_id: session.owner_id.clone(),
            parent_file_id: session.parent_file_id,
            version_id: stored.version_id.clone(),
            file_name: session.file_name.clone(),
            size: stored.size,
            content_type: stored.content_type.clone(),
            created_at: stored.created_at,
        };
        if let Err(e) = self.metadata.record_version(&record).await {
            let err = Error::from(e);
            tracing::error!(
                upload_id = %id,
                file_id = %stored.object_id,
                version_id = %stored.version_id,
                error = %err,
                "Stored object version could not be recorded"
            );
            registry
                .compare_and_set(id, CompletionState::Reassembling, CompletionState::Failed)
                .await;
            self.fail(session, &err).await;
            return Err(err);
        }

        registry
            .compare_and_set(id, CompletionState::Reassembling, CompletionState::Done)
            .await;
        self.sessions.teardown(id, TeardownReason::Completed).await;

        tracing::info!(
            upload_id = %id,
            owner_id = %session.owner_id,
            file_id = %stored.object_id,
            version_id = %stored.version_id,
            size = stored.size,
            "Upload complete"
        );
        self.events.publish(UploadEvent::Completed {
            owner_id: session.owner_id.clone(),
            file_id: stored.object_id,
            version_id: stored.version_id,
            upload_session_id: *id,
            file_name: session.file_name.clone(),
        });
        Ok(ChunkAck::complete(stored.object_id))
    }

    /// Tear down a session that has already been moved to `Failed` because
    /// of `err`, and tell subscribers why.
    async fn fail(&self, session: &UploadSession, err: &Error) {
        tracing::warn!(upload_id = %session.id, error = %err, "Upload session failed");
        self.close(session, TeardownReason::Failed, err.to_string())
            .await;
    }

    async fn close(&self, session: &UploadSession, reason: TeardownReason, message: String) {
        // Whoever removes the entry reports it, so a racing teardown never
        // produces a second event.
        if self.sessions.teardown(&session.id, reason).await.is_none() {
            return;
        }
        self.events.publish(UploadEvent::Failed {
            owner_id: session.owner_id.clone(),
            file_id: session.target_file_id,
            upload_session_id: session.id,
            file_name: session.file_name.clone(),
            reason: message,
            retryable: false,
        });
    }
}
