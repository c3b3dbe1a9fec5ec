//! Message delivery status and its transition rules.

use serde::{Deserialize, Serialize};

/// Delivery lifecycle of a message as shown to the user.
///
/// Legal transitions:
///
/// ```text
/// sending ──▶ sent ──▶ delivered ──▶ read
///    │         │           │
///    └─────────┴───────────┴──▶ failed
/// ```
///
/// `read` and `failed` are terminal for this subsystem - a retry of a
/// failed message creates a new message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Optimistically shown while the send is in progress.
    Sending,
    /// Accepted by the server.
    Sent,
    /// Reached the recipient's device.
    Delivered,
    /// Seen by the recipient.
    Read,
    /// Unrecoverable failure; the UI offers a retry affordance.
    Failed,
}

impl MessageStatus {
    /// Whether this status ends the lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Read | Self::Failed)
    }

    /// Whether a transition from `self` to `next` is legal.
    ///
    /// Any non-terminal status may fail; forward progress otherwise moves
    /// one step at a time.
    pub fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Sending, Self::Sent)
            | (Self::Sent, Self::Delivered)
            | (Self::Delivered, Self::Read) => true,
            (from, Self::Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One entry in the status-change stream consumed by the UI layer.
///
/// Exactly one of the flag groups describes why the event was emitted: an
/// optimistic local write, a remote confirmation, a rollback to an
/// authoritative value, or a permanent failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEvent {
    /// Message the event is about.
    pub message_id: String,
    /// The status value carried by the event. For rollback events this is
    /// the authoritative value just confirmed remotely, which may be older
    /// than the current optimistic value.
    pub status: MessageStatus,
    /// Emitted synchronously from an optimistic local write.
    pub is_optimistic: bool,
    /// The remote store acknowledged this value.
    pub is_confirmed: bool,
    /// The confirmed value disagreed with a newer optimistic value.
    pub is_rollback: bool,
    /// The update hit an error (always set on permanent failures).
    pub has_error: bool,
    /// Retries are exhausted; no further attempts will be made.
    pub is_permanent_failure: bool,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}
