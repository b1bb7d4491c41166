// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Dynamics compression stage keeping boosted tabs from clipping.

/// Compression parameters. The defaults match the fixed curve the extension
/// always ran: gentle soft knee, fast attack, moderate release.
#[derive(Debug, Clone, Copy)]
pub struct CompressorParams {
    pub threshold_db: f32,
    pub knee_db: f32,
    pub ratio: f32,
    pub attack_s: f32,
    pub release_s: f32,
}

impl Default for CompressorParams {
    fn default() -> Self {
        Self {
            threshold_db: -24.0,
            knee_db: 30.0,
            ratio: 12.0,
            attack_s: 0.003,
            release_s: 0.25,
        }
    }
}

/// Feed-forward dynamics compressor with a soft-knee gain computer and a
/// one-pole attack/release envelope.
#[derive(Debug)]
pub struct DynamicsCompressor {
    params: CompressorParams,
    attack_coeff: f32,
    release_coeff: f32,
    /// Current gain reduction in dB (always <= 0).
    envelope_db: f32,
}

impl DynamicsCompressor {
    pub fn new(sample_rate: f32) -> Self {
        Self::with_params(sample_rate, CompressorParams::default())
    }

    pub fn with_params(sample_rate: f32, params: CompressorParams) -> Self {
        Self {
            params,
            attack_coeff: smoothing_coeff(params.attack_s, sample_rate),
            release_coeff: smoothing_coeff(params.release_s, sample_rate),
            envelope_db: 0.0,
        }
    }

    /// Static curve: gain reduction in dB for an input level in dB.
    fn reduction_db(&self, level_db: f32) -> f32 {
        let p = self.params;
        let over = level_db - p.threshold_db;
        let half_knee = p.knee_db / 2.0;

        let out_db = if over <= -half_knee {
            level_db
        } else if over < half_knee {
            let x = over + half_knee;
            level_db + (1.0 / p.ratio - 1.0) * x * x / (2.0 * p.knee_db)
        } else {
            p.threshold_db + over / p.ratio
        };
        out_db - level_db
    }

    /// Compress a block of samples in place.
    pub fn process(&mut self, frames: &mut [f32]) {
        for sample in frames.iter_mut() {
            let level_db = 20.0 * sample.abs().max(1e-6).log10();
            let target_db = self.reduction_db(level_db);

            // More reduction needed -> attack, recovering -> release.
            let coeff = if target_db < self.envelope_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.envelope_db = target_db + coeff * (self.envelope_db - target_db);

            *sample *= db_to_linear(self.envelope_db);
        }
    }
}

fn smoothing_coeff(time_s: f32, sample_rate: f32) -> f32 {
    (-1.0 / (time_s * sample_rate)).exp()
}

fn db_to_linear(db: f32) -> f32 {
    if db <= -96.0 {
        0.0
    } else {
        10.0_f32.powf(db / 20.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::SAMPLE_RATE;

    #[test]
    fn test_default_curve() {
        let params = CompressorParams::default();
        assert_eq!(params.threshold_db, -24.0);
        assert_eq!(params.knee_db, 30.0);
        assert_eq!(params.ratio, 12.0);
        assert_eq!(params.attack_s, 0.003);
        assert_eq!(params.release_s, 0.25);
    }

    #[test]
    fn test_loud_signal_is_attenuated() {
        let mut comp = DynamicsCompressor::new(SAMPLE_RATE);
        // 0 dBFS square-ish input, well above the -24 dB threshold.
        let mut frames = vec![1.0_f32; 4800];
        comp.process(&mut frames);

        let settled = frames[frames.len() - 1].abs();
        assert!(
            settled < 0.5,
            "expected heavy reduction on a 0 dBFS input, got {settled}"
        );
    }

    #[test]
    fn test_quiet_signal_passes_near_unity() {
        let mut comp = DynamicsCompressor::new(SAMPLE_RATE);
        // -60 dBFS input, far below the knee.
        let mut frames = vec![0.001_f32; 4800];
        comp.process(&mut frames);

        let settled = frames[frames.len() - 1];
        assert!(
            (settled - 0.001).abs() < 1e-4,
            "expected near-unity gain on a quiet input, got {settled}"
        );
    }

    #[test]
    fn test_reduction_monotonic() {
        let comp = DynamicsCompressor::new(SAMPLE_RATE);
        assert_eq!(comp.reduction_db(-80.0), 0.0);
        let at_threshold = comp.reduction_db(-24.0);
        let above = comp.reduction_db(0.0);
        assert!(at_threshold <= 0.0);
        assert!(above < at_threshold);
    }
}
