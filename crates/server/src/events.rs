//! Upload outcome events for live-status subscribers.
//!
//! The transport that pushes these to clients lives outside this crate; it
//! subscribes to a [`BroadcastEvents`] sink and forwards what it receives.

use filevault_core::{FileId, UploadId, VersionId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Default number of events buffered for slow subscribers.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Terminal outcome of an upload session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UploadEvent {
    #[serde(rename_all = "camelCase")]
    Completed {
        owner_id: String,
        file_id: FileId,
        version_id: VersionId,
        upload_session_id: UploadId,
        file_name: String,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        owner_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        file_id: Option<FileId>,
        upload_session_id: UploadId,
        file_name: String,
        reason: String,
        retryable: bool,
    },
}

impl UploadEvent {
    pub fn owner_id(&self) -> &str {
        match self {
            Self::Completed { owner_id, .. } | Self::Failed { owner_id, .. } => owner_id,
        }
    }

    pub fn upload_session_id(&self) -> UploadId {
        match self {
            Self::Completed {
                upload_session_id, ..
            }
            | Self::Failed {
                upload_session_id, ..
            } => *upload_session_id,
        }
    }
}

/// Destination for upload events.
///
/// Publishing never fails the upload that produced the event.
pub trait EventSink: Send + Sync + 'static {
    fn publish(&self, event: UploadEvent);
}

/// Fan-out sink backed by a Tokio broadcast channel.
#[derive(Clone)]
pub struct BroadcastEvents {
    sender: broadcast::Sender<UploadEvent>,
}

impl BroadcastEvents {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEvents {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventSink for BroadcastEvents {
    fn publish(&self, event: UploadEvent) {
        tracing::debug!(
            upload_id = %event.upload_session_id(),
            owner_id = %event.owner_id(),
            "Publishing upload event"
        );
        // No subscribers is normal when nobody is watching.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let session = UploadId::new();
        let event = UploadEvent::Failed {
            owner_id: "u1".into(),
            file_id: None,
            upload_session_id: session,
            file_name: "a.bin".into(),
            reason: "session expired".into(),
            retryable: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "failed");
        assert_eq!(json["ownerId"], "u1");
        assert_eq!(json["uploadSessionId"], serde_json::to_value(session).unwrap());
        assert!(json.get("fileId").is_none());
        assert_eq!(json["retryable"], false);
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let events = BroadcastEvents::default();
        let mut rx = events.subscribe();
        let event = UploadEvent::Completed {
            owner_id: "u1".into(),
            file_id: FileId::new(),
            version_id: VersionId::parse("v1").unwrap(),
            upload_session_id: UploadId::new(),
            file_name: "a.bin".into(),
        };
        events.publish(event.clone());
        assert_eq!(rx.recv().await.unwrap(), event);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let events = BroadcastEvents::new(1);
        events.publish(UploadEvent::Failed {
            owner_id: "u1".into(),
            file_id: None,
            upload_session_id: UploadId::new(),
            file_name: "a.bin".into(),
            reason: "aborted".into(),
            retryable: false,
        });
    }
}
