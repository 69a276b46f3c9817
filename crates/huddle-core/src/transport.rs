use std::future::Future;

use crate::errors::TransportError;
use crate::events::{Callback, ConnectionState};
use crate::tracks::TrackKind;

/// Identifies a published local track on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackHandle {
    pub sid: String,
}

/// A chat message delivered by the transport from another participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChatMessage {
    pub id: String,
    pub author_name: String,
    pub text: String,
    pub timestamp_ms: u64,
}

/// The real-time media transport the surface drives.
///
/// Callbacks registered here may fire from any task; the surface only
/// forwards them into its own queue.
pub trait Transport: Send + Sync + 'static {
    /// Publish the local track of `kind`, captured from `device_id` when the kind has devices.
    fn publish(
        &self,
        kind: TrackKind,
        device_id: Option<&str>,
    ) -> impl Future<Output = Result<TrackHandle, TransportError>> + Send;

    fn unpublish(&self, kind: TrackKind) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn send_chat(&self, text: &str) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn on_remote_message(&self, callback: Callback<RemoteChatMessage>);

    fn on_connection_state_change(&self, callback: Callback<ConnectionState>);
}
