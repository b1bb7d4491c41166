// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-tab audio processor: captured stream -> gain stage -> compressor.

use crate::audio::compressor::DynamicsCompressor;
use crate::host::{CaptureStream, TabId};
use tabgain_ipc::{clamp_gain, GAIN_MAX};
use tracing::debug;

/// Signal chain for one controlled tab.
///
/// Muting zeroes the applied scalar without discarding the stored gain, so
/// unmuting restores the previous level.
pub struct TabAudioProcessor {
    tab_id: TabId,
    stream: CaptureStream,
    /// Linear gain scalar, 1.0 = unity.
    gain: f32,
    muted: bool,
    compressor: DynamicsCompressor,
    stopped: bool,
}

impl TabAudioProcessor {
    pub fn new(tab_id: TabId, stream: CaptureStream, initial_gain: u32, sample_rate: f32) -> Self {
        Self {
            tab_id,
            stream,
            gain: clamp_gain(Some(initial_gain as f64)) as f32 / 100.0,
            muted: false,
            compressor: DynamicsCompressor::new(sample_rate),
            stopped: false,
        }
    }

    #[allow(dead_code)]
    pub fn gain_percent(&self) -> u32 {
        (self.gain * 100.0).round() as u32
    }

    #[allow(dead_code)]
    pub fn is_muted(&self) -> bool {
        self.muted
    }

    #[allow(dead_code)]
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    #[allow(dead_code)]
    pub fn stream(&self) -> &CaptureStream {
        &self.stream
    }

    fn effective_gain(&self) -> f32 {
        if self.muted {
            0.0
        } else {
            self.gain
        }
    }

    pub fn set_gain(&mut self, gain: u32) {
        self.gain = gain.min(GAIN_MAX) as f32 / 100.0;
    }

    pub fn set_mute(&mut self, muted: bool) {
        self.muted = muted;
    }

    /// Next captured frame block, if the stream is still delivering.
    pub fn pull_frames(&mut self) -> Option<Vec<f32>> {
        if self.stopped {
            return None;
        }
        self.stream.pull()
    }

    /// Run a block through the gain and compression stages in place.
    pub fn render(&mut self, frames: &mut [f32]) {
        let gain = self.effective_gain();
        for sample in frames.iter_mut() {
            *sample *= gain;
        }
        self.compressor.process(frames);
    }

    /// Tear down the chain and release every stream track. Idempotent.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.stream.stop_tracks();
        debug!("Audio processor stopped for tab {}", self.tab_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SAMPLE_RATE;
    use crate::host::CaptureStream;
    use std::sync::mpsc;

    fn stream() -> (mpsc::Sender<Vec<f32>>, CaptureStream) {
        let (tx, rx) = mpsc::channel();
        (tx, CaptureStream::with_frames("stream-test", rx))
    }

    #[test]
    fn test_initial_gain_is_validated() {
        let (_tx, s) = stream();
        let p = TabAudioProcessor::new(1, s, 250, SAMPLE_RATE);
        assert_eq!(p.gain_percent(), 250);

        let (_tx, s) = stream();
        let p = TabAudioProcessor::new(1, s, 9000, SAMPLE_RATE);
        assert_eq!(p.gain_percent(), 600);
    }

    #[test]
    fn test_mute_preserves_gain() {
        let (_tx, s) = stream();
        let mut p = TabAudioProcessor::new(1, s, 200, SAMPLE_RATE);

        p.set_mute(true);
        let mut frames = vec![0.1_f32; 8];
        p.render(&mut frames);
        assert!(frames.iter().all(|&s| s == 0.0));
        assert_eq!(p.gain_percent(), 200);

        p.set_mute(false);
        let mut frames = vec![0.1_f32; 8];
        p.render(&mut frames);
        assert!(frames.iter().all(|&s| s > 0.1));
    }

    #[test]
    fn test_render_applies_gain_scalar() {
        let (_tx, s) = stream();
        let mut p = TabAudioProcessor::new(1, s, 50, SAMPLE_RATE);
        let mut frames = vec![0.01_f32; 4];
        p.render(&mut frames);
        // Quiet input stays below the compressor threshold, so only the
        // gain stage applies.
        for sample in frames {
            assert!((sample - 0.005).abs() < 1e-4);
        }
    }

    #[test]
    fn test_stop_is_idempotent_and_releases_tracks() {
        let (tx, s) = stream();
        let mut p = TabAudioProcessor::new(1, s, 100, SAMPLE_RATE);
        assert_eq!(p.stream().live_tracks(), 1);

        p.stop();
        assert!(p.is_stopped());
        assert_eq!(p.stream().live_tracks(), 0);

        p.stop();
        assert_eq!(p.stream().live_tracks(), 0);

        tx.send(vec![0.5]).ok();
        assert_eq!(p.pull_frames(), None);
    }
}
