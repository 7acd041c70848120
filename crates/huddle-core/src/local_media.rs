use std::sync::Arc;

use crate::errors::HuddleError;
use crate::events::CallPhase;
use crate::media::{AudioCapture, LocalAudioTrack};

/// Local call state as seen by the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalCallState {
    pub is_call_active: bool,
    pub is_muted: bool,
    /// Most recent fatal error; overwritten, never accumulated.
    pub error: Option<String>,
}

/// Self-mute with host override.
///
/// A host mute locks the microphone: self toggles are ignored until the
/// matching host unmute, which clears both the lock and the mute.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuteState {
    muted: bool,
    host_locked: bool,
}

impl MuteState {
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_host_locked(&self) -> bool {
        self.host_locked
    }

    /// Flips the self-mute. Returns `None` while host-locked.
    pub fn toggle(&mut self) -> Option<bool> {
        if self.host_locked {
            return None;
        }
        self.muted = !self.muted;
        Some(self.muted)
    }

    pub fn host_mute(&mut self) {
        self.muted = true;
        self.host_locked = true;
    }

    pub fn host_unmute(&mut self) {
        self.muted = false;
        self.host_locked = false;
    }
}

/// Owns the microphone capture and the self-mute flag.
///
/// The outgoing track is handed to every peer connection as a clone; only
/// this type enables, disables or stops it.
pub struct LocalMedia {
    capture: Arc<dyn AudioCapture>,
    track: Option<LocalAudioTrack>,
    phase: CallPhase,
    mute: MuteState,
    error: Option<String>,
}

impl LocalMedia {
    pub fn new(capture: Arc<dyn AudioCapture>) -> Self {
        Self {
            capture,
            track: None,
            phase: CallPhase::Idle,
            mute: MuteState::default(),
            error: None,
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn capture(&self) -> Arc<dyn AudioCapture> {
        self.capture.clone()
    }

    pub fn track(&self) -> Option<&LocalAudioTrack> {
        self.track.as_ref()
    }

    pub fn mute_state(&self) -> MuteState {
        self.mute
    }

    pub fn state(&self) -> LocalCallState {
        LocalCallState {
            is_call_active: self.phase == CallPhase::Active,
            is_muted: self.mute.is_muted(),
            error: self.error.clone(),
        }
    }

    /// Claims the start. Returns false when a call is already starting or
    /// active, which makes concurrent starts no-ops.
    pub fn begin_start(&mut self) -> bool {
        if self.phase != CallPhase::Idle {
            return false;
        }
        self.phase = CallPhase::Starting;
        self.error = None;
        true
    }

    /// Installs the acquired track. Returns false (and stops the track) if
    /// the start was cancelled while the microphone prompt was pending.
    pub fn finish_start(&mut self, track: LocalAudioTrack) -> bool {
        if self.phase != CallPhase::Starting {
            track.stop();
            return false;
        }
        track.set_enabled(!self.mute.is_muted());
        self.track = Some(track);
        self.phase = CallPhase::Active;
        true
    }

    /// Records a call-start failure and returns to idle.
    pub fn fail_start(&mut self, error: &HuddleError) {
        if let Some(track) = self.track.take() {
            track.stop();
        }
        self.phase = CallPhase::Idle;
        self.mute = MuteState::default();
        self.error = Some(error.to_string());
    }

    /// Returns the new mute flag, or `None` if the host lock ignored it.
    pub fn toggle_mute(&mut self) -> Option<bool> {
        let muted = self.mute.toggle()?;
        self.apply_to_track();
        Some(muted)
    }

    pub fn apply_host_mute(&mut self) {
        self.mute.host_mute();
        self.apply_to_track();
    }

    pub fn apply_host_unmute(&mut self) {
        self.mute.host_unmute();
        self.apply_to_track();
    }

    /// Stops the track and resets to initial values. Idempotent.
    pub fn reset(&mut self) {
        if let Some(track) = self.track.take() {
            track.stop();
        }
        self.phase = CallPhase::Idle;
        self.mute = MuteState::default();
        self.error = None;
    }

    fn apply_to_track(&self) {
        if let Some(track) = &self.track {
            track.set_enabled(!self.mute.is_muted());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoCapture;

    #[async_trait]
    impl AudioCapture for NoCapture {
        async fn acquire(&self) -> Result<LocalAudioTrack, HuddleError> {
            Err(HuddleError::PermissionDenied("test".into()))
        }
    }

    fn active() -> (LocalMedia, LocalAudioTrack) {
        let mut media = LocalMedia::new(Arc::new(NoCapture));
        let track = LocalAudioTrack::new();
        assert!(media.begin_start());
        assert!(media.finish_start(track.clone()));
        (media, track)
    }

    #[test]
    fn host_mute_dominates_self_toggle() {
        let (mut media, track) = active();

        media.apply_host_mute();
        assert!(media.state().is_muted);
        assert!(!track.is_enabled());

        assert_eq!(media.toggle_mute(), None);
        assert!(media.state().is_muted);
        assert!(!track.is_enabled());

        media.apply_host_unmute();
        assert!(!media.state().is_muted);
        assert!(track.is_enabled());
    }

    #[test]
    fn host_unmute_clears_prior_self_mute() {
        let (mut media, _track) = active();
        assert_eq!(media.toggle_mute(), Some(true));
        media.apply_host_mute();
        media.apply_host_unmute();
        assert!(!media.state().is_muted);
        assert_eq!(media.toggle_mute(), Some(true));
    }

    #[test]
    fn toggle_flips_track_without_stopping_it() {
        let (mut media, track) = active();
        assert_eq!(media.toggle_mute(), Some(true));
        assert!(!track.is_enabled());
        assert_eq!(media.toggle_mute(), Some(false));
        assert!(track.is_enabled());
        assert!(track.is_live());
    }

    #[test]
    fn concurrent_start_is_rejected() {
        let mut media = LocalMedia::new(Arc::new(NoCapture));
        assert!(media.begin_start());
        assert!(!media.begin_start());
        assert_eq!(media.phase(), CallPhase::Starting);
    }

    #[test]
    fn cancelled_start_stops_acquired_track() {
        let mut media = LocalMedia::new(Arc::new(NoCapture));
        assert!(media.begin_start());
        media.reset();

        let track = LocalAudioTrack::new();
        assert!(!media.finish_start(track.clone()));
        assert!(track.is_stopped());
        assert!(!media.state().is_call_active);
    }

    #[test]
    fn failure_sets_single_error() {
        let mut media = LocalMedia::new(Arc::new(NoCapture));
        media.begin_start();
        media.fail_start(&HuddleError::PermissionDenied("denied".into()));
        media.begin_start();
        media.fail_start(&HuddleError::RoomFull(5));

        let state = media.state();
        assert!(!state.is_call_active);
        assert_eq!(state.error.as_deref(), Some("room is full (5 participants max)"));
    }

    #[test]
    fn reset_is_idempotent() {
        let (mut media, track) = active();
        media.apply_host_mute();
        media.reset();
        media.reset();
        assert!(track.is_stopped());
        assert_eq!(media.state(), LocalCallState::default());
        assert!(media.track().is_none());
    }
}
