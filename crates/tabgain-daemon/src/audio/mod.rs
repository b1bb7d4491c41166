// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio worker: per-tab processors and the thread that owns them.

pub mod compressor;
pub mod processor;
pub mod worker;

pub use worker::{AudioError, AudioThread};

/// Sample rate the processing chain runs at.
pub const SAMPLE_RATE: f32 = 48_000.0;
