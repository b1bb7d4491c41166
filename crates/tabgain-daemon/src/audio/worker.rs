// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Audio thread management and per-tab processor lifecycle.

use crate::audio::processor::TabAudioProcessor;
use crate::audio::SAMPLE_RATE;
use crate::host::{AudioSink, CaptureStream, TabHost, TabId};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Commands sent from the coordinator to the audio thread. Every request
/// carries its own reply channel.
pub enum AudioCommand {
    Process {
        tab_id: TabId,
        stream: CaptureStream,
        gain: u32,
        reply: mpsc::Sender<Result<(), AudioError>>,
    },
    Restore {
        tab_id: TabId,
        gain: u32,
        reply: mpsc::Sender<Result<(), AudioError>>,
    },
    Check {
        tab_id: TabId,
        reply: mpsc::Sender<bool>,
    },
    SetGain {
        tab_id: TabId,
        gain: u32,
        reply: mpsc::Sender<Result<(), AudioError>>,
    },
    SetMute {
        tab_id: TabId,
        muted: bool,
        reply: mpsc::Sender<Result<(), AudioError>>,
    },
    Stop {
        tab_id: TabId,
        reply: mpsc::Sender<Result<(), AudioError>>,
    },
    Shutdown,
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("Tab {0} is already being processed")]
    AlreadyProcessing(TabId),
    #[error("No processor found for tab {0}")]
    NoProcessor(TabId),
    #[error("Stream capture failed: {0}")]
    Capture(String),
    #[error("Playback output unavailable: {0}")]
    Output(String),
    #[error("Audio thread error: {0}")]
    Thread(String),
    #[error("Audio thread is not running")]
    ChannelClosed,
}

/// Handle to the audio thread.
pub struct AudioThread {
    cmd_tx: mpsc::Sender<AudioCommand>,
    handle: Option<JoinHandle<()>>,
}

impl AudioThread {
    /// Spawn the audio thread. The host is used for re-capture on restore and
    /// for the playback destination.
    pub fn spawn(host: Arc<dyn TabHost>) -> Result<Self, AudioError> {
        let (cmd_tx, cmd_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("tabgain-audio".to_string())
            .spawn(move || run_audio_loop(cmd_rx, host))
            .map_err(|e| AudioError::Thread(e.to_string()))?;

        info!("Audio thread started");
        Ok(Self {
            cmd_tx,
            handle: Some(handle),
        })
    }

    fn send(&self, cmd: AudioCommand) -> Result<(), AudioError> {
        self.cmd_tx.send(cmd).map_err(|_| AudioError::ChannelClosed)
    }

    fn roundtrip(
        &self,
        make: impl FnOnce(mpsc::Sender<Result<(), AudioError>>) -> AudioCommand,
    ) -> Result<(), AudioError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(make(reply_tx))?;
        reply_rx.recv().map_err(|_| AudioError::ChannelClosed)?
    }

    /// Build a processor for a freshly captured stream.
    pub fn process(
        &self,
        tab_id: TabId,
        stream: CaptureStream,
        gain: u32,
    ) -> Result<(), AudioError> {
        self.roundtrip(|reply| AudioCommand::Process {
            tab_id,
            stream,
            gain,
            reply,
        })
    }

    /// Reuse an existing processor at the given gain, or re-capture and build
    /// a fresh one.
    pub fn restore(&self, tab_id: TabId, gain: u32) -> Result<(), AudioError> {
        self.roundtrip(|reply| AudioCommand::Restore {
            tab_id,
            gain,
            reply,
        })
    }

    /// Whether a processor currently exists for the tab.
    pub fn has_processor(&self, tab_id: TabId) -> Result<bool, AudioError> {
        let (reply_tx, reply_rx) = mpsc::channel();
        self.send(AudioCommand::Check {
            tab_id,
            reply: reply_tx,
        })?;
        reply_rx.recv().map_err(|_| AudioError::ChannelClosed)
    }

    pub fn set_gain(&self, tab_id: TabId, gain: u32) -> Result<(), AudioError> {
        self.roundtrip(|reply| AudioCommand::SetGain {
            tab_id,
            gain,
            reply,
        })
    }

    pub fn set_mute(&self, tab_id: TabId, muted: bool) -> Result<(), AudioError> {
        self.roundtrip(|reply| AudioCommand::SetMute {
            tab_id,
            muted,
            reply,
        })
    }

    /// Stop and release the tab's processor.
    pub fn stop(&self, tab_id: TabId) -> Result<(), AudioError> {
        self.roundtrip(|reply| AudioCommand::Stop { tab_id, reply })
    }

    /// Stop every processor and join the thread.
    pub fn shutdown(&mut self) {
        let _ = self.cmd_tx.send(AudioCommand::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AudioThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct WorkerState {
    host: Arc<dyn TabHost>,
    processors: HashMap<TabId, TabAudioProcessor>,
    destination: Option<Box<dyn AudioSink>>,
}

impl WorkerState {
    fn new(host: Arc<dyn TabHost>) -> Self {
        Self {
            host,
            processors: HashMap::new(),
            destination: None,
        }
    }

    /// Open the shared playback destination on first use.
    fn ensure_destination(&mut self) -> Result<(), AudioError> {
        if self.destination.is_none() {
            let sink = self
                .host
                .playback_sink()
                .map_err(|e| AudioError::Output(e.to_string()))?;
            self.destination = Some(sink);
            debug!("Playback destination opened");
        }
        Ok(())
    }

    fn process(
        &mut self,
        tab_id: TabId,
        stream: CaptureStream,
        gain: u32,
    ) -> Result<(), AudioError> {
        if self.processors.contains_key(&tab_id) {
            return Err(AudioError::AlreadyProcessing(tab_id));
        }
        self.ensure_destination()?;

        let processor = TabAudioProcessor::new(tab_id, stream, gain, SAMPLE_RATE);
        self.processors.insert(tab_id, processor);
        debug!("Processor created for tab {} at gain {}%", tab_id, gain);
        Ok(())
    }

    fn restore(&mut self, tab_id: TabId, gain: u32) -> Result<(), AudioError> {
        if let Some(processor) = self.processors.get_mut(&tab_id) {
            processor.set_gain(gain);
            return Ok(());
        }

        let stream = self
            .host
            .capture_stream(tab_id)
            .map_err(|e| AudioError::Capture(e.to_string()))?;
        self.process(tab_id, stream, gain)
    }

    fn set_gain(&mut self, tab_id: TabId, gain: u32) -> Result<(), AudioError> {
        let processor = self
            .processors
            .get_mut(&tab_id)
            .ok_or(AudioError::NoProcessor(tab_id))?;
        processor.set_gain(gain);
        Ok(())
    }

    fn set_mute(&mut self, tab_id: TabId, muted: bool) -> Result<(), AudioError> {
        let processor = self
            .processors
            .get_mut(&tab_id)
            .ok_or(AudioError::NoProcessor(tab_id))?;
        processor.set_mute(muted);
        Ok(())
    }

    fn stop(&mut self, tab_id: TabId) -> Result<(), AudioError> {
        let mut processor = self
            .processors
            .remove(&tab_id)
            .ok_or(AudioError::NoProcessor(tab_id))?;
        processor.stop();
        Ok(())
    }

    fn stop_all(&mut self) {
        for (_, mut processor) in self.processors.drain() {
            processor.stop();
        }
    }

    /// Route pending captured frames through each chain to the destination.
    fn pump(&mut self) {
        let Some(destination) = self.destination.as_mut() else {
            return;
        };
        for processor in self.processors.values_mut() {
            while let Some(mut frames) = processor.pull_frames() {
                processor.render(&mut frames);
                if let Err(e) = destination.write_frames(&frames) {
                    warn!("Playback write failed: {}", e);
                    return;
                }
            }
        }
    }

    /// Returns false when the thread should exit.
    fn handle(&mut self, cmd: AudioCommand) -> bool {
        match cmd {
            AudioCommand::Process {
                tab_id,
                stream,
                gain,
                reply,
            } => {
                let _ = reply.send(self.process(tab_id, stream, gain));
            }
            AudioCommand::Restore {
                tab_id,
                gain,
                reply,
            } => {
                let _ = reply.send(self.restore(tab_id, gain));
            }
            AudioCommand::Check { tab_id, reply } => {
                let _ = reply.send(self.processors.contains_key(&tab_id));
            }
            AudioCommand::SetGain {
                tab_id,
                gain,
                reply,
            } => {
                let _ = reply.send(self.set_gain(tab_id, gain));
            }
            AudioCommand::SetMute {
                tab_id,
                muted,
                reply,
            } => {
                let _ = reply.send(self.set_mute(tab_id, muted));
            }
            AudioCommand::Stop { tab_id, reply } => {
                let _ = reply.send(self.stop(tab_id));
            }
            AudioCommand::Shutdown => return false,
        }
        true
    }
}

fn run_audio_loop(cmd_rx: mpsc::Receiver<AudioCommand>, host: Arc<dyn TabHost>) {
    let mut state = WorkerState::new(host);

    loop {
        match cmd_rx.recv_timeout(Duration::from_millis(10)) {
            Ok(cmd) => {
                if !state.handle(cmd) {
                    break;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                error!("Audio command channel closed unexpectedly");
                break;
            }
        }
        state.pump();
    }

    // Release every open stream before exiting.
    state.stop_all();
    info!("Audio thread stopped");
}
