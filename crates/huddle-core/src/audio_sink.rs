use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::PoisonError;

/// Frame RMS (on the i16 scale) above which a peer counts as speaking.
const SPEAKING_RMS_THRESHOLD: f64 = 500.0;

/// 2 seconds of 48kHz mono audio.
const DEFAULT_MAX_SAMPLES: usize = 48_000 * 2;

/// Per-peer ring buffer for decoded remote audio.
///
/// The transport pushes PCM frames in; platform audio output pulls them
/// out. When the consumer falls behind, the oldest samples are discarded.
/// Each pushed frame also updates the peer's speaking flag.
///
/// After [`AudioSink::release`] the sink is inert: pushes are ignored and
/// pulls return silence.
pub struct AudioSink {
    inner: Mutex<SinkInner>,
    max_samples: usize,
}

struct SinkInner {
    buffer: VecDeque<i16>,
    speaking: bool,
    released: bool,
}

impl AudioSink {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_SAMPLES)
    }

    pub fn with_capacity(max_samples: usize) -> Self {
        Self {
            inner: Mutex::new(SinkInner {
                buffer: VecDeque::with_capacity(max_samples),
                speaking: false,
                released: false,
            }),
            max_samples,
        }
    }

    /// Push one decoded frame.
    ///
    /// Returns `Some(speaking)` when the speaking flag changed.
    pub fn push_samples(&self, samples: &[i16]) -> Option<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.released {
            return None;
        }
        inner.buffer.extend(samples.iter().copied());

        let overflow = inner.buffer.len().saturating_sub(self.max_samples);
        if overflow > 0 {
            inner.buffer.drain(..overflow);
        }

        let speaking = rms(samples) > SPEAKING_RMS_THRESHOLD;
        if speaking != inner.speaking {
            inner.speaking = speaking;
            Some(speaking)
        } else {
            None
        }
    }

    /// Pull up to `out.len()` samples; the unfilled tail is zeroed.
    pub fn pull_samples(&self, out: &mut [i16]) -> usize {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let available = inner.buffer.len().min(out.len());

        for (slot, sample) in out.iter_mut().zip(inner.buffer.drain(..available)) {
            *slot = sample;
        }
        for slot in out.iter_mut().skip(available) {
            *slot = 0;
        }

        available
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).speaking
    }

    pub fn buffered(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).buffer.len()
    }

    /// Drop buffered audio and stop accepting frames. Idempotent.
    pub fn release(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        inner.buffer.clear();
        inner.speaking = false;
        inner.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).released
    }
}

impl Default for AudioSink {
    fn default() -> Self {
        Self::new()
    }
}

fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| f64::from(s) * f64::from(s)).sum();
    (sum / samples.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_pull() {
        let sink = AudioSink::new();
        sink.push_samples(&[100, 200, 300, 400, 500]);

        let mut out = vec![0i16; 3];
        assert_eq!(sink.pull_samples(&mut out), 3);
        assert_eq!(out, vec![100, 200, 300]);

        let mut out2 = vec![0i16; 5];
        assert_eq!(sink.pull_samples(&mut out2), 2);
        assert_eq!(out2, vec![400, 500, 0, 0, 0]);
    }

    #[test]
    fn overflow_drops_oldest() {
        let sink = AudioSink::with_capacity(4);
        sink.push_samples(&[1, 2, 3, 4]);
        sink.push_samples(&[5, 6]);

        let mut out = vec![0i16; 6];
        assert_eq!(sink.pull_samples(&mut out), 4);
        assert_eq!(out, vec![3, 4, 5, 6, 0, 0]);
    }

    #[test]
    fn speaking_follows_frame_level() {
        let sink = AudioSink::new();
        assert_eq!(sink.push_samples(&[10, -10, 5]), None);
        assert_eq!(sink.push_samples(&[4000, -4000, 3000]), Some(true));
        assert_eq!(sink.push_samples(&[3500, -3500]), None);
        assert!(sink.is_speaking());
        assert_eq!(sink.push_samples(&[0, 0, 0]), Some(false));
        assert!(!sink.is_speaking());
    }

    #[test]
    fn released_sink_is_inert() {
        let sink = AudioSink::new();
        sink.push_samples(&[4000, 4000]);
        sink.release();
        sink.release();

        assert!(sink.is_released());
        assert!(!sink.is_speaking());
        assert_eq!(sink.push_samples(&[9000; 8]), None);
        assert_eq!(sink.buffered(), 0);

        let mut out = vec![7i16; 2];
        assert_eq!(sink.pull_samples(&mut out), 0);
        assert_eq!(out, vec![0, 0]);
    }
}
