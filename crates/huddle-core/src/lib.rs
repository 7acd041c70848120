//! Huddle core: peer-mesh voice calls for Watch Together rooms.
//!
//! Pure Rust crate with no platform dependencies. Signaling, media
//! transport, microphone capture and the room roster are traits supplied
//! by the host; native UI shells consume the crate via UniFFI bindings.

pub mod audio_sink;
pub mod call;
pub mod connection;
pub mod election;
pub mod errors;
pub mod events;
pub mod local_media;
pub mod loopback;
pub mod media;
pub mod moderation;
pub mod roster;
pub mod roster_http;
pub mod settings;
pub mod signaling;

pub use call::{CallClient, CallConfig, CallDeps};
pub use connection::{CloseReason, PeerState};
pub use errors::HuddleError;
pub use events::{CallPhase, CallSnapshot, EventEmitter, HuddleEvent, HuddleEventListener, PeerInfo};
pub use media::{
    AudioCapture, ConnectionSpec, LocalAudioTrack, MediaConnection, MediaEngine, SdpKind,
    SessionDescription, TransportEvent, TransportEventKind, TransportSink, TransportState,
};
pub use roster::{Admission, MemoryRoster, Participant, ParticipantRole, Room, RoomMode, RosterStore};
pub use roster_http::RestRosterStore;
pub use settings::{Settings, SettingsStore};
pub use signaling::{
    ChannelEvent, IceCandidate, PeerId, PresenceMeta, SignalPayload, SignalingChannel,
    SignalingMessage,
};
