//! LiveKit room as a [`Transport`].
//!
//! Publishing creates a native audio or video source per track kind. The
//! host feeds captured frames into the source returned by
//! [`LiveKitTransport::media_source`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use livekit::data_stream::StreamTextOptions;
use livekit::id::TrackSid;
use livekit::options::TrackPublishOptions;
use livekit::prelude::*;
use livekit::track::TrackSource as LkTrackSource;
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::prelude::*;
use livekit::webrtc::video_source::native::NativeVideoSource;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::errors::TransportError;
use crate::events::{Callback, ConnectionState, Subscribers};
use crate::tracks::TrackKind;
use crate::transport::{RemoteChatMessage, TrackHandle, Transport};

/// The topic used by LiveKit Meet for chat messages.
const CHAT_TOPIC: &str = "lk.chat";

/// Data-packet topic used by older LiveKit Meet clients.
const LEGACY_CHAT_TOPIC: &str = "lk-chat-topic";

const AUDIO_SAMPLE_RATE: u32 = 48_000;
const AUDIO_CHANNELS: u32 = 1;
const AUDIO_QUEUE_SIZE_MS: u32 = 100;

const VIDEO_WIDTH: u32 = 1280;
const VIDEO_HEIGHT: u32 = 720;

/// Capture source behind a published track.
#[derive(Clone)]
pub enum MediaSource {
    Audio(NativeAudioSource),
    Video(NativeVideoSource),
}

/// Which sid the room holds for each kind.
///
/// An entry is only removed once the room confirms the unpublish, so a
/// failed unpublish leaves the sid around to retry on the next publish.
struct PublishedTracks<Sid, Source> {
    tracks: Mutex<HashMap<TrackKind, (Sid, Source)>>,
}

impl<Sid: Clone + PartialEq, Source: Clone> PublishedTracks<Sid, Source> {
    fn new() -> Self {
        Self {
            tracks: Mutex::new(HashMap::new()),
        }
    }

    fn insert(&self, kind: TrackKind, sid: Sid, source: Source) {
        self.tracks.lock().insert(kind, (sid, source));
    }

    fn sid(&self, kind: TrackKind) -> Option<Sid> {
        self.tracks.lock().get(&kind).map(|(sid, _)| sid.clone())
    }

    fn source(&self, kind: TrackKind) -> Option<Source> {
        self.tracks.lock().get(&kind).map(|(_, source)| source.clone())
    }

    /// Run `unpublish` on the sid held for `kind`, forgetting it only on success.
    async fn unpublish_with<F, Fut, E>(&self, kind: TrackKind, unpublish: F) -> Result<(), E>
    where
        F: FnOnce(Sid) -> Fut,
        Fut: Future<Output = Result<(), E>>,
    {
        let Some(sid) = self.sid(kind) else {
            return Ok(());
        };
        unpublish(sid.clone()).await?;
        self.confirm_unpublished(kind, &sid);
        Ok(())
    }

    /// Forget `kind` if it still maps to `sid`.
    fn confirm_unpublished(&self, kind: TrackKind, sid: &Sid) -> bool {
        let mut tracks = self.tracks.lock();
        if tracks.get(&kind).is_some_and(|(current, _)| current == sid) {
            tracks.remove(&kind);
            true
        } else {
            false
        }
    }

    fn clear(&self) {
        self.tracks.lock().clear();
    }
}

/// Chat payload sent on [`LEGACY_CHAT_TOPIC`].
#[derive(Deserialize)]
struct LegacyChatPayload {
    #[serde(default)]
    id: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    timestamp: u64,
    /// Set by clients that also send the message as a text stream.
    #[serde(default, rename = "ignoreLegacy")]
    ignore_legacy: bool,
}

/// Decode a legacy chat packet. `None` for malformed packets, empty text,
/// or packets whose sender also used the text stream.
fn legacy_chat_message(payload: &[u8], author_name: String) -> Option<RemoteChatMessage> {
    let packet: LegacyChatPayload = match serde_json::from_slice(payload) {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!("legacy chat packet ignored: {e}");
            return None;
        }
    };
    if packet.ignore_legacy {
        tracing::debug!(id = %packet.id, "legacy chat packet skipped, stream copy expected");
        return None;
    }
    if packet.message.is_empty() {
        return None;
    }
    // The timeline dedupes by id, so id-less packets each get their own.
    let id = if packet.id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        packet.id
    };
    Some(RemoteChatMessage {
        id,
        author_name,
        text: packet.message,
        timestamp_ms: packet.timestamp,
    })
}

pub struct LiveKitTransport {
    room: Arc<Room>,
    published: PublishedTracks<TrackSid, MediaSource>,
    messages: Arc<Subscribers<RemoteChatMessage>>,
    connection: Arc<Subscribers<ConnectionState>>,
}

impl LiveKitTransport {
    /// Join the room at `url` and start forwarding its events.
    pub async fn connect(url: &str, token: &str) -> Result<Arc<Self>, TransportError> {
        let mut options = RoomOptions::default();
        options.auto_subscribe = true;

        let (room, events) = Room::connect(url, token, options)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;

        let transport = Arc::new(Self {
            room: Arc::new(room),
            published: PublishedTracks::new(),
            messages: Arc::new(Subscribers::new()),
            connection: Arc::new(Subscribers::new()),
        });
        tokio::spawn(Self::event_loop(Arc::downgrade(&transport), events));

        tracing::info!("livekit room connected");
        Ok(transport)
    }

    pub fn media_source(&self, kind: TrackKind) -> Option<MediaSource> {
        self.published.source(kind)
    }

    /// Leave the room. Published tracks go with it.
    pub async fn close(&self) {
        self.published.clear();
        if let Err(e) = self.room.close().await {
            tracing::warn!("error closing room: {e}");
        }
    }

    async fn unpublish_tracked(&self, kind: TrackKind) -> Result<(), TransportError> {
        let participant = self.room.local_participant();
        self.published
            .unpublish_with(kind, |sid| async move {
                participant
                    .unpublish_track(&sid)
                    .await
                    .map(|_| ())
                    .map_err(|e| TransportError::Unpublish(format!("{kind}: {e}")))
            })
            .await
    }

    fn create_track(kind: TrackKind) -> (LocalTrack, LkTrackSource, MediaSource) {
        match kind {
            TrackKind::Microphone => {
                let source = NativeAudioSource::new(
                    AudioSourceOptions {
                        echo_cancellation: true,
                        noise_suppression: true,
                        auto_gain_control: true,
                    },
                    AUDIO_SAMPLE_RATE,
                    AUDIO_CHANNELS,
                    AUDIO_QUEUE_SIZE_MS,
                );
                let track = LocalAudioTrack::create_audio_track("microphone", RtcAudioSource::Native(source.clone()));
                (LocalTrack::Audio(track), LkTrackSource::Microphone, MediaSource::Audio(source))
            }
            TrackKind::Camera | TrackKind::ScreenShare => {
                let screencast = kind == TrackKind::ScreenShare;
                let source = NativeVideoSource::new(
                    VideoResolution {
                        width: VIDEO_WIDTH,
                        height: VIDEO_HEIGHT,
                    },
                    screencast,
                );
                let (name, lk_source) = if screencast {
                    ("screen_share", LkTrackSource::Screenshare)
                } else {
                    ("camera", LkTrackSource::Camera)
                };
                let track = LocalVideoTrack::create_video_track(name, RtcVideoSource::Native(source.clone()));
                (LocalTrack::Video(track), lk_source, MediaSource::Video(source))
            }
        }
    }

    async fn event_loop(weak: Weak<Self>, mut events: mpsc::UnboundedReceiver<RoomEvent>) {
        let mut reconnect_attempt: u32 = 0;

        while let Some(event) = events.recv().await {
            let Some(transport) = weak.upgrade() else { break };
            match event {
                RoomEvent::Connected { .. } => {
                    reconnect_attempt = 0;
                    transport.connection.emit(&ConnectionState::Connected);
                }

                RoomEvent::Reconnecting => {
                    reconnect_attempt += 1;
                    transport
                        .connection
                        .emit(&ConnectionState::Reconnecting { attempt: reconnect_attempt });
                }

                RoomEvent::Reconnected => {
                    reconnect_attempt = 0;
                    transport.connection.emit(&ConnectionState::Connected);
                }

                RoomEvent::Disconnected { reason } => {
                    tracing::info!("room disconnected: {reason:?}");
                    transport.published.clear();
                    transport.connection.emit(&ConnectionState::Disconnected);
                    break;
                }

                RoomEvent::ChatMessage { message, participant, .. } => {
                    let author_name = participant
                        .as_ref()
                        .map(|p| p.name().to_string())
                        .unwrap_or_default();
                    transport.messages.emit(&RemoteChatMessage {
                        id: message.id,
                        author_name,
                        text: message.message,
                        timestamp_ms: message.timestamp as u64,
                    });
                }

                RoomEvent::TextStreamOpened { reader, topic, participant_identity } => {
                    if topic != CHAT_TOPIC {
                        tracing::debug!(%topic, "text stream ignored");
                        continue;
                    }
                    let Some(reader) = reader.take() else {
                        tracing::warn!("chat text stream reader already taken");
                        continue;
                    };
                    let identity = participant_identity.to_string();
                    let author_name = transport
                        .room
                        .remote_participants()
                        .values()
                        .find(|p| p.identity().to_string() == identity)
                        .map(|p| p.name().to_string())
                        .unwrap_or_else(|| identity.clone());
                    let messages = transport.messages.clone();

                    tokio::spawn(async move {
                        let id = reader.info().id.clone();
                        let timestamp_ms = reader.info().timestamp.timestamp_millis().max(0) as u64;
                        match reader.read_all().await {
                            Ok(text) => messages.emit(&RemoteChatMessage {
                                id,
                                author_name,
                                text,
                                timestamp_ms,
                            }),
                            Err(e) => tracing::warn!("failed to read chat text stream: {e}"),
                        }
                    });
                }

                RoomEvent::DataReceived { payload, topic, participant, .. } => {
                    if topic.as_deref() != Some(LEGACY_CHAT_TOPIC) {
                        continue;
                    }
                    let author_name = participant
                        .as_ref()
                        .map(|p| p.name().to_string())
                        .unwrap_or_default();
                    if let Some(msg) = legacy_chat_message(&payload, author_name) {
                        transport.messages.emit(&msg);
                    }
                }

                _ => {
                    tracing::trace!("unhandled room event: {event:?}");
                }
            }
        }

        tracing::info!("room event loop ended");
    }
}

impl Transport for LiveKitTransport {
    async fn publish(&self, kind: TrackKind, device_id: Option<&str>) -> Result<TrackHandle, TransportError> {
        // A previous unpublish failed; the room still holds that track.
        if self.published.sid(kind).is_some() {
            self.unpublish_tracked(kind).await?;
        }

        let (track, lk_source, source) = Self::create_track(kind);
        let publication = self
            .room
            .local_participant()
            .publish_track(
                track,
                TrackPublishOptions {
                    source: lk_source,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TransportError::Publish(format!("{kind}: {e}")))?;

        let sid = publication.sid();
        tracing::info!(%kind, sid = %sid, ?device_id, "livekit track published");
        self.published.insert(kind, sid.clone(), source);
        Ok(TrackHandle { sid: sid.to_string() })
    }

    async fn unpublish(&self, kind: TrackKind) -> Result<(), TransportError> {
        self.unpublish_tracked(kind).await
    }

    async fn send_chat(&self, text: &str) -> Result<(), TransportError> {
        let options = StreamTextOptions {
            topic: CHAT_TOPIC.to_string(),
            ..Default::default()
        };
        self.room
            .local_participant()
            .send_text(text, options)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::Send(e.to_string()))
    }

    fn on_remote_message(&self, callback: Callback<RemoteChatMessage>) {
        self.messages.subscribe(callback);
    }

    fn on_connection_state_change(&self, callback: Callback<ConnectionState>) {
        self.connection.subscribe(callback);
    }
}
