// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Browser host access: tab queries, native mute, stream capture and playback.
//!
//! The coordinator and the audio worker consume the browser through the
//! [`TabHost`] trait; the production implementation is a D-Bus proxy to the
//! browser bridge, and tests substitute an in-memory host.

use std::fs::File;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use tabgain_ipc::TabSnapshot;
use thiserror::Error;
use tracing::{debug, warn};
use zbus::proxy;

/// Tab identifier assigned by the browser; never reused while a controller
/// for it is alive.
pub type TabId = u32;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Tab {0} not found")]
    TabNotFound(TabId),
    #[error("A capture session is already active for tab {0}")]
    CaptureConflict(TabId),
    #[error("Browser bridge call failed: {0}")]
    Bridge(String),
}

/// Events pushed by the browser, drained by the coordinator's event pass.
#[derive(Debug, Clone)]
pub enum HostEvent {
    TabClosed(TabId),
    TabAudibleChanged { tab_id: TabId, audible: bool },
}

/// Destination for processed audio frames.
pub trait AudioSink: Send {
    fn write_frames(&mut self, frames: &[f32]) -> std::io::Result<()>;
}

/// Access to the browser's tabs and media plumbing.
pub trait TabHost: Send + Sync {
    /// All tabs currently producing audio.
    fn audible_tabs(&self) -> Result<Vec<TabSnapshot>, HostError>;

    /// Look up a single tab.
    fn tab(&self, tab_id: TabId) -> Result<TabSnapshot, HostError>;

    /// Set the tab's native mute flag.
    fn set_native_mute(&self, tab_id: TabId, muted: bool) -> Result<(), HostError>;

    /// Start capturing the tab's audio output.
    fn capture_stream(&self, tab_id: TabId) -> Result<CaptureStream, HostError>;

    /// Open the shared playback destination processed audio is rendered to.
    fn playback_sink(&self) -> Result<Box<dyn AudioSink>, HostError>;
}

/// One track of a captured media stream. While any track is live the browser
/// shows its recording indicator for the tab.
#[derive(Debug)]
pub struct MediaTrack {
    live: AtomicBool,
}

impl MediaTrack {
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
        }
    }

    pub fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

impl Default for MediaTrack {
    fn default() -> Self {
        Self::new()
    }
}

/// A captured tab-audio stream: an opaque host stream id, its tracks, and a
/// channel of PCM frames fed by the host.
pub struct CaptureStream {
    stream_id: String,
    tracks: Vec<Arc<MediaTrack>>,
    frames: mpsc::Receiver<Vec<f32>>,
}

impl CaptureStream {
    pub fn with_frames(stream_id: impl Into<String>, frames: mpsc::Receiver<Vec<f32>>) -> Self {
        Self {
            stream_id: stream_id.into(),
            tracks: vec![Arc::new(MediaTrack::new())],
            frames,
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    /// Stop every track of the stream. Safe to call repeatedly.
    pub fn stop_tracks(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn live_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    /// Next pending frame block, if any. A fully stopped stream yields nothing.
    pub fn pull(&mut self) -> Option<Vec<f32>> {
        if self.live_tracks() == 0 {
            return None;
        }
        self.frames.try_recv().ok()
    }
}

/// D-Bus proxy for the browser bridge interface.
#[proxy(
    interface = "com.tabgain.Browser",
    default_service = "com.tabgain.Browser",
    default_path = "/com/tabgain/Browser"
)]
trait BrowserBridge {
    fn audible_tabs(&self) -> zbus::Result<Vec<TabSnapshot>>;
    fn tab(&self, tab_id: u32) -> zbus::Result<TabSnapshot>;
    fn set_muted(&self, tab_id: u32, muted: bool) -> zbus::Result<()>;
    /// Returns the capture stream id plus a descriptor carrying f32-le frames.
    fn capture_stream(&self, tab_id: u32) -> zbus::Result<(String, zbus::zvariant::OwnedFd)>;
    /// Returns a descriptor accepting processed f32-le frames for playback.
    fn open_playback(&self) -> zbus::Result<zbus::zvariant::OwnedFd>;

    #[zbus(signal)]
    fn tab_closed(&self, tab_id: u32) -> zbus::Result<()>;
    #[zbus(signal)]
    fn tab_audible_changed(&self, tab_id: u32, audible: bool) -> zbus::Result<()>;
}

/// Production [`TabHost`] backed by the browser bridge D-Bus service.
pub struct BrowserHost {
    proxy: BrowserBridgeProxyBlocking<'static>,
}

impl BrowserHost {
    /// Connect to the browser bridge on the session bus.
    pub fn connect() -> Result<Self, HostError> {
        let connection =
            zbus::blocking::Connection::session().map_err(|e| HostError::Bridge(e.to_string()))?;
        let proxy = BrowserBridgeProxyBlocking::new(&connection)
            .map_err(|e| HostError::Bridge(e.to_string()))?;
        debug!("Connected to browser bridge at {}", tabgain_ipc::BRIDGE_NAME);
        Ok(Self { proxy })
    }

    /// Forward bridge tab events into the coordinator's event channel.
    ///
    /// The forwarding threads exit when the receiving side is dropped.
    pub fn subscribe_events(&self, tx: mpsc::Sender<HostEvent>) -> Result<(), HostError> {
        let closed = self
            .proxy
            .receive_tab_closed()
            .map_err(|e| HostError::Bridge(e.to_string()))?;
        let closed_tx = tx.clone();
        thread::Builder::new()
            .name("tabgain-tab-closed".to_string())
            .spawn(move || {
                for signal in closed {
                    let Ok(args) = signal.args() else { continue };
                    if closed_tx.send(HostEvent::TabClosed(args.tab_id)).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| HostError::Bridge(e.to_string()))?;

        let audible = self
            .proxy
            .receive_tab_audible_changed()
            .map_err(|e| HostError::Bridge(e.to_string()))?;
        thread::Builder::new()
            .name("tabgain-tab-audible".to_string())
            .spawn(move || {
                for signal in audible {
                    let Ok(args) = signal.args() else { continue };
                    let event = HostEvent::TabAudibleChanged {
                        tab_id: args.tab_id,
                        audible: args.audible,
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            })
            .map_err(|e| HostError::Bridge(e.to_string()))?;

        Ok(())
    }
}

impl TabHost for BrowserHost {
    fn audible_tabs(&self) -> Result<Vec<TabSnapshot>, HostError> {
        self.proxy
            .audible_tabs()
            .map_err(|e| HostError::Bridge(e.to_string()))
    }

    fn tab(&self, tab_id: TabId) -> Result<TabSnapshot, HostError> {
        self.proxy.tab(tab_id).map_err(|e| match e {
            zbus::Error::MethodError(..) => HostError::TabNotFound(tab_id),
            other => HostError::Bridge(other.to_string()),
        })
    }

    fn set_native_mute(&self, tab_id: TabId, muted: bool) -> Result<(), HostError> {
        self.proxy
            .set_muted(tab_id, muted)
            .map_err(|e| HostError::Bridge(e.to_string()))
    }

    fn capture_stream(&self, tab_id: TabId) -> Result<CaptureStream, HostError> {
        let (stream_id, fd) = self.proxy.capture_stream(tab_id).map_err(|e| {
            // The bridge reports an in-flight capture by naming the active stream.
            if e.to_string().contains("active stream") {
                HostError::CaptureConflict(tab_id)
            } else {
                HostError::Bridge(e.to_string())
            }
        })?;

        let file = File::from(std::os::fd::OwnedFd::from(fd));
        let (frame_tx, frame_rx) = mpsc::channel();
        let stream = CaptureStream::with_frames(stream_id, frame_rx);
        debug!("Capture stream {} opened for tab {}", stream.stream_id(), tab_id);
        let track = stream.tracks()[0].clone();
        if let Err(e) = thread::Builder::new()
            .name(format!("tabgain-capture-{tab_id}"))
            .spawn(move || read_capture_frames(file, frame_tx, track))
        {
            warn!("Failed to spawn capture reader for tab {}: {}", tab_id, e);
        }
        Ok(stream)
    }

    fn playback_sink(&self) -> Result<Box<dyn AudioSink>, HostError> {
        let fd = self
            .proxy
            .open_playback()
            .map_err(|e| HostError::Bridge(e.to_string()))?;
        Ok(Box::new(FdSink {
            file: File::from(std::os::fd::OwnedFd::from(fd)),
        }))
    }
}

/// Pump f32-le PCM off the capture descriptor until the stream stops or the
/// bridge closes its end.
fn read_capture_frames(mut file: File, tx: mpsc::Sender<Vec<f32>>, track: Arc<MediaTrack>) {
    let mut carry: Vec<u8> = Vec::new();
    let mut buf = [0u8; 4096];

    while track.is_live() {
        match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                carry.extend_from_slice(&buf[..n]);
                let whole = carry.len() - carry.len() % 4;
                let mut frames = Vec::with_capacity(whole / 4);
                for chunk in carry[..whole].chunks_exact(4) {
                    frames.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
                }
                carry.drain(..whole);
                if !frames.is_empty() && tx.send(frames).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Capture stream read failed: {}", e);
                break;
            }
        }
    }
}

/// Playback destination writing f32-le frames to the bridge descriptor.
struct FdSink {
    file: File,
}

impl AudioSink for FdSink {
    fn write_frames(&mut self, frames: &[f32]) -> std::io::Result<()> {
        let mut bytes = Vec::with_capacity(frames.len() * 4);
        for sample in frames {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        self.file.write_all(&bytes)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// In-memory [`TabHost`] for state-machine and worker tests.
    pub struct MockHost {
        tabs: Mutex<HashMap<TabId, TabSnapshot>>,
        conflicts: Mutex<HashSet<TabId>>,
        /// Every `set_native_mute` call, in order.
        pub native_mutes: Mutex<Vec<(TabId, bool)>>,
        /// Every successful `capture_stream` call.
        pub captured: Mutex<Vec<TabId>>,
        frame_senders: Mutex<Vec<mpsc::Sender<Vec<f32>>>>,
        /// Frames written to the playback destination.
        pub played: Arc<Mutex<Vec<f32>>>,
    }

    impl MockHost {
        pub fn new() -> Self {
            Self {
                tabs: Mutex::new(HashMap::new()),
                conflicts: Mutex::new(HashSet::new()),
                native_mutes: Mutex::new(Vec::new()),
                captured: Mutex::new(Vec::new()),
                frame_senders: Mutex::new(Vec::new()),
                played: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn add_tab(&self, id: TabId, title: &str, url: &str, audible: bool, muted: bool) {
            self.tabs.lock().unwrap().insert(
                id,
                TabSnapshot {
                    id,
                    title: title.to_string(),
                    url: url.to_string(),
                    audible,
                    muted,
                },
            );
        }

        pub fn remove_tab(&self, id: TabId) {
            self.tabs.lock().unwrap().remove(&id);
        }

        /// Make the next capture for this tab fail with a conflict.
        pub fn set_capture_conflict(&self, id: TabId) {
            self.conflicts.lock().unwrap().insert(id);
        }

        pub fn capture_count(&self) -> usize {
            self.captured.lock().unwrap().len()
        }

        pub fn last_native_mute(&self) -> Option<(TabId, bool)> {
            self.native_mutes.lock().unwrap().last().copied()
        }
    }

    impl TabHost for MockHost {
        fn audible_tabs(&self) -> Result<Vec<TabSnapshot>, HostError> {
            let mut tabs: Vec<TabSnapshot> = self
                .tabs
                .lock()
                .unwrap()
                .values()
                .filter(|t| t.audible)
                .cloned()
                .collect();
            tabs.sort_by_key(|t| t.id);
            Ok(tabs)
        }

        fn tab(&self, tab_id: TabId) -> Result<TabSnapshot, HostError> {
            self.tabs
                .lock()
                .unwrap()
                .get(&tab_id)
                .cloned()
                .ok_or(HostError::TabNotFound(tab_id))
        }

        fn set_native_mute(&self, tab_id: TabId, muted: bool) -> Result<(), HostError> {
            let mut tabs = self.tabs.lock().unwrap();
            let tab = tabs.get_mut(&tab_id).ok_or(HostError::TabNotFound(tab_id))?;
            tab.muted = muted;
            self.native_mutes.lock().unwrap().push((tab_id, muted));
            Ok(())
        }

        fn capture_stream(&self, tab_id: TabId) -> Result<CaptureStream, HostError> {
            if self.conflicts.lock().unwrap().contains(&tab_id) {
                return Err(HostError::CaptureConflict(tab_id));
            }
            self.captured.lock().unwrap().push(tab_id);
            let (tx, rx) = mpsc::channel();
            self.frame_senders.lock().unwrap().push(tx);
            Ok(CaptureStream::with_frames(format!("stream-{tab_id}"), rx))
        }

        fn playback_sink(&self) -> Result<Box<dyn AudioSink>, HostError> {
            Ok(Box::new(SharedSink(self.played.clone())))
        }
    }

    struct SharedSink(Arc<Mutex<Vec<f32>>>);

    impl AudioSink for SharedSink {
        fn write_frames(&mut self, frames: &[f32]) -> std::io::Result<()> {
            self.0.lock().unwrap().extend_from_slice(frames);
            Ok(())
        }
    }
}
