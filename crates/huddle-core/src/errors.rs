use thiserror::Error;

#[derive(Debug, Error)]
pub enum HuddleError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("room error: {0}")]
    Room(String),
    #[error("room is full ({0} participants max)")]
    RoomFull(usize),
    #[error("room has expired")]
    RoomExpired,
    #[error("only the room host can do this")]
    NotHost,
    #[error("no active call")]
    NotInCall,
    #[error("roster error: {0}")]
    Roster(String),
    #[error("HTTP error: {0}")]
    Http(String),
    #[error("invalid signaling payload: {0}")]
    Decode(#[from] serde_json::Error),
}
