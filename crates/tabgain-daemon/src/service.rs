// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Core daemon service logic and controller state management.

use crate::audio::{AudioError, AudioThread};
use crate::config::{sanitize_string, ConfigManager, ControllerSnapshot, SavedController, MIN_DOMAIN_LEN};
use crate::host::{HostError, HostEvent, TabHost, TabId};
use std::collections::HashMap;
use std::sync::{mpsc, Arc};
use tabgain_ipc::{
    clamp_gain, Command, ControlError, ControlledTabInfo, Reply, TabInfo, GAIN_DEFAULT,
};
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, info, warn};

/// D-Bus signal events that need to be emitted.
#[derive(Debug, Clone)]
pub enum SignalEvent {
    /// The audible or controlled tab set changed while the panel is open.
    TabsUpdated,
}

/// The coordinator's record of one tab under active volume control.
#[derive(Debug, Clone)]
pub struct TabController {
    /// Hostname captured when control started.
    pub domain: String,
    /// Native mute flag at activation time, restored on deactivation.
    pub original_muted: bool,
    /// Current gain percentage (100 = unity).
    pub current_gain: u32,
    pub is_muted: bool,
}

impl TabController {
    fn from_saved(saved: &SavedController) -> Self {
        Self {
            domain: saved.domain.clone(),
            original_muted: saved.original_muted,
            current_gain: saved.current_gain,
            is_muted: saved.is_muted,
        }
    }

    fn to_saved(&self, tab_id: TabId) -> SavedController {
        SavedController {
            tab_id,
            domain: self.domain.clone(),
            original_muted: self.original_muted,
            current_gain: self.current_gain,
            is_muted: self.is_muted,
        }
    }
}

/// Extract the hostname a preference is keyed on.
fn domain_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
}

/// The main coordinator service. The in-memory controller table is the sole
/// source of truth for which tabs are controlled; the persisted snapshot is a
/// write-through mirror used for startup recovery.
pub struct CoordinatorService {
    controllers: HashMap<TabId, TabController>,
    popup_open: bool,
    host: Arc<dyn TabHost>,
    audio: AudioThread,
    config: ConfigManager,
    /// Sender for D-Bus signal events.
    signal_tx: Option<tokio_mpsc::UnboundedSender<SignalEvent>>,
    host_event_rx: Option<mpsc::Receiver<HostEvent>>,
}

impl CoordinatorService {
    pub fn new(host: Arc<dyn TabHost>, audio: AudioThread, config: ConfigManager) -> Self {
        Self {
            controllers: HashMap::new(),
            popup_open: false,
            host,
            audio,
            config,
            signal_tx: None,
            host_event_rx: None,
        }
    }

    /// Set the signal sender for D-Bus signal events.
    pub fn set_signal_sender(&mut self, tx: tokio_mpsc::UnboundedSender<SignalEvent>) {
        self.signal_tx = Some(tx);
    }

    /// Set the receiver for browser-side tab events.
    pub fn set_host_event_receiver(&mut self, rx: mpsc::Receiver<HostEvent>) {
        self.host_event_rx = Some(rx);
    }

    pub fn is_controlled(&self, tab_id: TabId) -> bool {
        self.controllers.contains_key(&tab_id)
    }

    /// Handle one panel command.
    pub fn dispatch(&mut self, command: Command) -> Result<Reply, ControlError> {
        match command {
            Command::StartVolumeControl { tab_id } => self.start_volume_control(tab_id),
            Command::StopVolumeControl { tab_id } => self.stop_volume_control(tab_id),
            Command::SetVolume { tab_id, volume } => self.set_volume(tab_id, volume),
            Command::MuteTab { tab_id, muted } => self.mute_tab(tab_id, muted),
            Command::GetAudibleTabs => self.get_audible_tabs(),
            Command::GetControlledTabs => self.get_controlled_tabs(),
            Command::GetDomainGain { domain } => self.get_domain_gain(&domain),
            Command::SaveDomainGain { domain, gain } => self.save_domain_gain(&domain, gain),
            Command::PopupOpened => {
                self.popup_open = true;
                Ok(Reply::Ack)
            }
            Command::PopupClosed => {
                self.popup_open = false;
                Ok(Reply::Ack)
            }
        }
    }

    fn start_volume_control(&mut self, tab_id: TabId) -> Result<Reply, ControlError> {
        // Already controlled: report the current state, never capture twice.
        if let Some(controller) = self.controllers.get(&tab_id) {
            return Ok(Reply::Started {
                domain: controller.domain.clone(),
                default_gain: controller.current_gain,
            });
        }

        let tab = self
            .host
            .tab(tab_id)
            .map_err(|e| ControlError::HostCall(e.to_string()))?;
        if !tab.audible {
            return Err(ControlError::NotAudible(tab_id));
        }

        let domain = domain_of(&tab.url)
            .ok_or_else(|| ControlError::HostCall(format!("Tab {tab_id} has no valid URL")))?;
        let gain = self
            .config
            .load_domain_gain(&domain)
            .map_err(|e| ControlError::HostCall(e.to_string()))?
            .unwrap_or(GAIN_DEFAULT);

        // The worker may still own a processor from a previous panel session;
        // reuse it instead of opening a second capture.
        if self.audio.has_processor(tab_id).unwrap_or(false) {
            if let Err(e) = self.audio.set_gain(tab_id, gain) {
                warn!("Could not update reused processor for tab {}: {}", tab_id, e);
            }
        } else {
            match self.host.capture_stream(tab_id) {
                Ok(stream) => {
                    self.host
                        .set_native_mute(tab_id, true)
                        .map_err(|e| ControlError::HostCall(e.to_string()))?;

                    if let Err(e) = self.audio.process(tab_id, stream, gain) {
                        // Leave the tab exactly as we found it.
                        if let Err(e2) = self.host.set_native_mute(tab_id, tab.muted) {
                            warn!("Could not restore native mute for tab {}: {}", tab_id, e2);
                        }
                        return Err(match e {
                            AudioError::AlreadyProcessing(id) => ControlError::CaptureConflict(id),
                            other => ControlError::HostCall(other.to_string()),
                        });
                    }
                }
                Err(HostError::CaptureConflict(_)) => {
                    // A capture session for this tab is already live (worker
                    // kept it across a coordinator restart). Adopt it; the
                    // processor's actual gain is not reconciled here.
                    info!("Adopting existing capture session for tab {}", tab_id);
                }
                Err(e) => return Err(ControlError::HostCall(e.to_string())),
            }
        }

        self.controllers.insert(
            tab_id,
            TabController {
                domain: domain.clone(),
                original_muted: tab.muted,
                current_gain: gain,
                is_muted: false,
            },
        );
        self.persist_controllers();

        info!("Volume control started for tab {} ({}) at {}%", tab_id, domain, gain);
        Ok(Reply::Started {
            domain,
            default_gain: gain,
        })
    }

    fn stop_volume_control(&mut self, tab_id: TabId) -> Result<Reply, ControlError> {
        let original_muted = self
            .controllers
            .get(&tab_id)
            .ok_or(ControlError::NotControlled(tab_id))?
            .original_muted;

        match self.audio.stop(tab_id) {
            Ok(()) => {}
            // Adopted controllers may never have had a live processor.
            Err(AudioError::NoProcessor(_)) => {
                debug!("No worker processor for tab {} at stop", tab_id)
            }
            Err(e) => return Err(ControlError::HostCall(e.to_string())),
        }

        self.host
            .set_native_mute(tab_id, original_muted)
            .map_err(|e| ControlError::HostCall(e.to_string()))?;

        self.controllers.remove(&tab_id);
        self.persist_controllers();

        info!("Volume control stopped for tab {}", tab_id);
        Ok(Reply::Ack)
    }

    fn set_volume(&mut self, tab_id: TabId, volume: f64) -> Result<Reply, ControlError> {
        if !self.controllers.contains_key(&tab_id) {
            return Err(ControlError::NotControlled(tab_id));
        }

        let gain = clamp_gain(Some(volume));
        match self.audio.set_gain(tab_id, gain) {
            Ok(()) => {}
            Err(AudioError::NoProcessor(_)) => {
                debug!("No worker processor for tab {} at set_volume", tab_id)
            }
            Err(e) => return Err(ControlError::HostCall(e.to_string())),
        }

        if let Some(controller) = self.controllers.get_mut(&tab_id) {
            controller.current_gain = gain;
        }
        Ok(Reply::Ack)
    }

    fn mute_tab(&mut self, tab_id: TabId, muted: bool) -> Result<Reply, ControlError> {
        if !self.controllers.contains_key(&tab_id) {
            return Err(ControlError::NotControlled(tab_id));
        }

        match self.audio.set_mute(tab_id, muted) {
            Ok(()) => {}
            Err(AudioError::NoProcessor(_)) => {
                debug!("No worker processor for tab {} at mute", tab_id)
            }
            Err(e) => return Err(ControlError::HostCall(e.to_string())),
        }

        if let Some(controller) = self.controllers.get_mut(&tab_id) {
            controller.is_muted = muted;
        }
        Ok(Reply::Ack)
    }

    fn get_audible_tabs(&mut self) -> Result<Reply, ControlError> {
        let tabs = self
            .host
            .audible_tabs()
            .map_err(|e| ControlError::HostCall(e.to_string()))?;

        let infos = tabs
            .into_iter()
            .map(|tab| {
                let title = if tab.title.is_empty() {
                    "Untitled".to_string()
                } else {
                    tab.title
                };
                let domain = domain_of(&tab.url).unwrap_or_else(|| "unknown".to_string());
                TabInfo {
                    id: tab.id,
                    title: sanitize_string(&title),
                    url: tab.url,
                    domain: sanitize_string(&domain),
                    controlled: self.is_controlled(tab.id),
                }
            })
            .collect();

        Ok(Reply::AudibleTabs(infos))
    }

    fn get_controlled_tabs(&mut self) -> Result<Reply, ControlError> {
        let mut infos = Vec::new();
        let mut dead = Vec::new();

        for (&tab_id, controller) in &self.controllers {
            match self.host.tab(tab_id) {
                Ok(tab) => {
                    let title = if tab.title.is_empty() {
                        "Untitled".to_string()
                    } else {
                        tab.title
                    };
                    infos.push(ControlledTabInfo {
                        id: tab_id,
                        title: sanitize_string(&title),
                        domain: sanitize_string(&controller.domain),
                        current_gain: controller.current_gain,
                        is_muted: controller.is_muted,
                    });
                }
                Err(_) => dead.push(tab_id),
            }
        }

        if !dead.is_empty() {
            for tab_id in dead {
                debug!("Pruning controller for vanished tab {}", tab_id);
                self.controllers.remove(&tab_id);
            }
            self.persist_controllers();
        }

        infos.sort_by_key(|t| t.id);
        Ok(Reply::ControlledTabs(infos))
    }

    fn get_domain_gain(&self, domain: &str) -> Result<Reply, ControlError> {
        let sanitized = sanitize_string(domain);
        if sanitized.len() < MIN_DOMAIN_LEN {
            // An unusable key just means "no preference".
            return Ok(Reply::DomainGain(GAIN_DEFAULT));
        }

        let gain = self
            .config
            .load_domain_gain(&sanitized)
            .map_err(|e| ControlError::HostCall(e.to_string()))?
            .unwrap_or(GAIN_DEFAULT);
        Ok(Reply::DomainGain(gain))
    }

    fn save_domain_gain(&self, domain: &str, gain: f64) -> Result<Reply, ControlError> {
        let sanitized = sanitize_string(domain);
        if sanitized.len() < MIN_DOMAIN_LEN {
            return Err(ControlError::InvalidDomain);
        }

        let gain = clamp_gain(Some(gain));
        self.config
            .save_domain_gain(&sanitized, gain)
            .map_err(|e| ControlError::HostCall(e.to_string()))?;
        debug!("Saved gain {}% for domain {}", gain, sanitized);
        Ok(Reply::Ack)
    }

    /// Drain pending browser events.
    pub fn process_host_events(&mut self) {
        let events: Vec<HostEvent> = match &self.host_event_rx {
            Some(rx) => rx.try_iter().collect(),
            None => return,
        };

        for event in events {
            match event {
                HostEvent::TabClosed(tab_id) => self.handle_tab_closed(tab_id),
                HostEvent::TabAudibleChanged { tab_id, audible } => {
                    debug!("Tab {} audible changed: {}", tab_id, audible);
                    self.notify_tabs_updated();
                }
            }
        }
    }

    /// A tab went away. The tab no longer exists, so there is no native mute
    /// flag to restore; just release the processor and forget the controller.
    fn handle_tab_closed(&mut self, tab_id: TabId) {
        if self.controllers.remove(&tab_id).is_some() {
            if let Err(e) = self.audio.stop(tab_id) {
                debug!("Worker stop for closed tab {} failed: {}", tab_id, e);
            }
            self.persist_controllers();
            info!("Tab {} closed, controller released", tab_id);
        }
        self.notify_tabs_updated();
    }

    /// Tell an open panel the tab list changed. A vanished panel is expected
    /// and non-fatal.
    fn notify_tabs_updated(&self) {
        if !self.popup_open {
            return;
        }
        if let Some(ref tx) = self.signal_tx {
            if let Err(e) = tx.send(SignalEvent::TabsUpdated) {
                warn!("Failed to send signal event: {}", e);
            }
        }
    }

    /// Startup recovery: re-register persisted controllers whose tabs are
    /// still alive and audible, rebuilding their processors at the saved
    /// gain. Everything else is dropped, then the cleaned map is re-saved.
    pub fn restore_controllers(&mut self) {
        let snapshot = match self.config.load_controllers() {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("Could not load controller snapshot: {}", e);
                return;
            }
        };

        for saved in snapshot.controllers {
            match self.host.tab(saved.tab_id) {
                Ok(tab) if tab.audible => {
                    match self.audio.restore(saved.tab_id, saved.current_gain) {
                        Ok(()) => {
                            self.controllers
                                .insert(saved.tab_id, TabController::from_saved(&saved));
                            info!(
                                "Restored volume control for tab {} ({}) at {}%",
                                saved.tab_id, saved.domain, saved.current_gain
                            );
                        }
                        Err(e) => {
                            warn!("Dropping controller for tab {}: {}", saved.tab_id, e);
                        }
                    }
                }
                _ => {
                    debug!("Tab {} no longer audible, dropping saved controller", saved.tab_id);
                }
            }
        }

        self.persist_controllers();
    }

    /// Run the domain-preference maintenance pass.
    pub fn run_domain_maintenance(&self) {
        match self.config.cleanup_stale_domains() {
            Ok(0) => {}
            Ok(removed) => info!("Domain maintenance removed {} entries", removed),
            Err(e) => warn!("Domain maintenance failed: {}", e),
        }
    }

    fn persist_controllers(&self) {
        let snapshot = ControllerSnapshot {
            controllers: self
                .controllers
                .iter()
                .map(|(&tab_id, controller)| controller.to_saved(tab_id))
                .collect(),
        };
        if let Err(e) = self.config.save_controllers(&snapshot) {
            warn!("Failed to save controller snapshot: {}", e);
        }
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down coordinator service");
        self.persist_controllers();
        self.audio.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::testing::MockHost;
    use tempfile::TempDir;

    fn service(host: Arc<MockHost>) -> (TempDir, CoordinatorService) {
        let dir = TempDir::new().expect("tempdir");
        let config = ConfigManager::with_dir(dir.path().to_path_buf());
        let audio = AudioThread::spawn(host.clone() as Arc<dyn TabHost>).expect("audio thread");
        (dir, CoordinatorService::new(host, audio, config))
    }

    fn start(svc: &mut CoordinatorService, tab_id: TabId) -> Result<Reply, ControlError> {
        svc.dispatch(Command::StartVolumeControl { tab_id })
    }

    #[test]
    fn test_control_scenario() {
        let host = Arc::new(MockHost::new());
        host.add_tab(7, "Example", "https://example.com/watch", true, false);
        let (_dir, mut svc) = service(host.clone());

        let reply = start(&mut svc, 7).unwrap();
        assert_eq!(
            reply,
            Reply::Started {
                domain: "example.com".to_string(),
                default_gain: 100,
            }
        );

        assert_eq!(
            svc.dispatch(Command::SetVolume {
                tab_id: 7,
                volume: 250.0
            })
            .unwrap(),
            Reply::Ack
        );

        match svc.dispatch(Command::GetControlledTabs).unwrap() {
            Reply::ControlledTabs(tabs) => {
                assert_eq!(tabs.len(), 1);
                assert_eq!(tabs[0].id, 7);
                assert_eq!(tabs[0].domain, "example.com");
                assert_eq!(tabs[0].current_gain, 250);
                assert!(!tabs[0].is_muted);
            }
            other => panic!("unexpected reply {other:?}"),
        }

        assert_eq!(
            svc.dispatch(Command::StopVolumeControl { tab_id: 7 }).unwrap(),
            Reply::Ack
        );
        match svc.dispatch(Command::GetControlledTabs).unwrap() {
            Reply::ControlledTabs(tabs) => assert!(tabs.is_empty()),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_activation_is_idempotent() {
        let host = Arc::new(MockHost::new());
        host.add_tab(7, "Example", "https://example.com/", true, false);
        let (_dir, mut svc) = service(host.clone());

        let first = start(&mut svc, 7).unwrap();
        let second = start(&mut svc, 7).unwrap();
        assert_eq!(first, second);
        assert_eq!(host.capture_count(), 1);
    }

    #[test]
    fn test_activation_requires_audible_tab() {
        let host = Arc::new(MockHost::new());
        host.add_tab(3, "Silent", "https://example.com/", false, false);
        let (_dir, mut svc) = service(host.clone());

        assert!(matches!(start(&mut svc, 3), Err(ControlError::NotAudible(3))));
        assert!(!svc.is_controlled(3));
        assert_eq!(host.capture_count(), 0);
    }

    #[test]
    fn test_activation_uses_saved_domain_gain() {
        let host = Arc::new(MockHost::new());
        host.add_tab(5, "Example", "https://example.com/", true, false);
        let (_dir, mut svc) = service(host.clone());

        svc.dispatch(Command::SaveDomainGain {
            domain: "example.com".to_string(),
            gain: 320.0,
        })
        .unwrap();

        let reply = start(&mut svc, 5).unwrap();
        assert_eq!(
            reply,
            Reply::Started {
                domain: "example.com".to_string(),
                default_gain: 320,
            }
        );
    }

    #[test]
    fn test_capture_conflict_adopts_session() {
        let host = Arc::new(MockHost::new());
        host.add_tab(7, "Example", "https://example.com/", true, false);
        host.set_capture_conflict(7);
        let (_dir, mut svc) = service(host.clone());

        let reply = start(&mut svc, 7).unwrap();
        assert_eq!(
            reply,
            Reply::Started {
                domain: "example.com".to_string(),
                default_gain: 100,
            }
        );
        assert!(svc.is_controlled(7));
        // The adopted session keeps the tab untouched: no capture, no mute.
        assert_eq!(host.capture_count(), 0);
        assert!(host.native_mutes.lock().unwrap().is_empty());
    }

    #[test]
    fn test_deactivation_restores_original_mute() {
        let host = Arc::new(MockHost::new());
        host.add_tab(7, "Example", "https://example.com/", true, false);
        let (_dir, mut svc) = service(host.clone());

        start(&mut svc, 7).unwrap();
        assert_eq!(host.last_native_mute(), Some((7, true)));

        // Mute toggles while controlled must not affect the restored flag.
        svc.dispatch(Command::MuteTab {
            tab_id: 7,
            muted: true,
        })
        .unwrap();
        svc.dispatch(Command::MuteTab {
            tab_id: 7,
            muted: false,
        })
        .unwrap();

        svc.dispatch(Command::StopVolumeControl { tab_id: 7 }).unwrap();
        assert_eq!(host.last_native_mute(), Some((7, false)));
    }

    #[test]
    fn test_deactivation_restores_muted_tab() {
        let host = Arc::new(MockHost::new());
        host.add_tab(8, "Muted", "https://example.com/", true, true);
        let (_dir, mut svc) = service(host.clone());

        start(&mut svc, 8).unwrap();
        svc.dispatch(Command::StopVolumeControl { tab_id: 8 }).unwrap();
        assert_eq!(host.last_native_mute(), Some((8, true)));
    }

    #[test]
    fn test_mutations_require_controller() {
        let host = Arc::new(MockHost::new());
        let (_dir, mut svc) = service(host);

        assert!(matches!(
            svc.dispatch(Command::SetVolume {
                tab_id: 1,
                volume: 150.0
            }),
            Err(ControlError::NotControlled(1))
        ));
        assert!(matches!(
            svc.dispatch(Command::MuteTab {
                tab_id: 1,
                muted: true
            }),
            Err(ControlError::NotControlled(1))
        ));
        assert!(matches!(
            svc.dispatch(Command::StopVolumeControl { tab_id: 1 }),
            Err(ControlError::NotControlled(1))
        ));
    }

    #[test]
    fn test_set_volume_clamps_input() {
        let host = Arc::new(MockHost::new());
        host.add_tab(7, "Example", "https://example.com/", true, false);
        let (_dir, mut svc) = service(host);

        start(&mut svc, 7).unwrap();
        svc.dispatch(Command::SetVolume {
            tab_id: 7,
            volume: 700.0,
        })
        .unwrap();

        match svc.dispatch(Command::GetControlledTabs).unwrap() {
            Reply::ControlledTabs(tabs) => assert_eq!(tabs[0].current_gain, 600),
            other => panic!("unexpected reply {other:?}"),
        }

        // Zero is a valid volume, not a fallback case.
        svc.dispatch(Command::SetVolume {
            tab_id: 7,
            volume: 0.0,
        })
        .unwrap();
        match svc.dispatch(Command::GetControlledTabs).unwrap() {
            Reply::ControlledTabs(tabs) => assert_eq!(tabs[0].current_gain, 0),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_audible_tabs_flag_controlled() {
        let host = Arc::new(MockHost::new());
        host.add_tab(1, "One", "https://one.example/", true, false);
        host.add_tab(2, "<b>Two</b>", "https://two.example/", true, false);
        host.add_tab(3, "Silent", "https://three.example/", false, false);
        let (_dir, mut svc) = service(host);

        start(&mut svc, 1).unwrap();
        match svc.dispatch(Command::GetAudibleTabs).unwrap() {
            Reply::AudibleTabs(tabs) => {
                assert_eq!(tabs.len(), 2);
                assert!(tabs[0].controlled);
                assert!(!tabs[1].controlled);
                assert_eq!(tabs[1].title, "&lt;b&gt;Two&lt;/b&gt;");
                assert_eq!(tabs[0].domain, "one.example");
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn test_controlled_tabs_prunes_dead_tabs() {
        let host = Arc::new(MockHost::new());
        host.add_tab(7, "Example", "https://example.com/", true, false);
        let (_dir, mut svc) = service(host.clone());

        start(&mut svc, 7).unwrap();
        host.remove_tab(7);

        match svc.dispatch(Command::GetControlledTabs).unwrap() {
            Reply::ControlledTabs(tabs) => assert!(tabs.is_empty()),
            other => panic!("unexpected reply {other:?}"),
        }
        assert!(!svc.is_controlled(7));
    }

    #[test]
    fn test_domain_gain_round_trip_and_validation() {
        let host = Arc::new(MockHost::new());
        let (_dir, mut svc) = service(host);

        assert!(matches!(
            svc.dispatch(Command::SaveDomainGain {
                domain: "ab".to_string(),
                gain: 200.0
            }),
            Err(ControlError::InvalidDomain)
        ));

        // Unknown or invalid domains read back as unity.
        assert_eq!(
            svc.dispatch(Command::GetDomainGain {
                domain: "x".to_string()
            })
            .unwrap(),
            Reply::DomainGain(100)
        );

        svc.dispatch(Command::SaveDomainGain {
            domain: "  example.com  ".to_string(),
            gain: 250.7,
        })
        .unwrap();
        assert_eq!(
            svc.dispatch(Command::GetDomainGain {
                domain: "example.com".to_string()
            })
            .unwrap(),
            Reply::DomainGain(250)
        );
    }

    #[test]
    fn test_tab_closed_releases_controller() {
        let host = Arc::new(MockHost::new());
        host.add_tab(7, "Example", "https://example.com/", true, false);
        let (dir, mut svc) = service(host.clone());

        start(&mut svc, 7).unwrap();

        let (tx, rx) = mpsc::channel();
        svc.set_host_event_receiver(rx);
        host.remove_tab(7);
        tx.send(HostEvent::TabClosed(7)).unwrap();
        svc.process_host_events();

        assert!(!svc.is_controlled(7));
        // No native-mute restore for a tab that no longer exists.
        assert_eq!(host.last_native_mute(), Some((7, true)));

        let config = ConfigManager::with_dir(dir.path().to_path_buf());
        assert!(config.load_controllers().unwrap().controllers.is_empty());
    }

    #[test]
    fn test_startup_recovery() {
        let host = Arc::new(MockHost::new());
        host.add_tab(7, "Alive", "https://example.com/", true, false);
        let dir = TempDir::new().expect("tempdir");

        // Snapshot from a previous run: tab 7 is still audible, tab 9 is gone.
        let config = ConfigManager::with_dir(dir.path().to_path_buf());
        config
            .save_controllers(&ControllerSnapshot {
                controllers: vec![
                    SavedController {
                        tab_id: 7,
                        domain: "example.com".to_string(),
                        original_muted: false,
                        current_gain: 250,
                        is_muted: false,
                    },
                    SavedController {
                        tab_id: 9,
                        domain: "gone.example".to_string(),
                        original_muted: true,
                        current_gain: 150,
                        is_muted: false,
                    },
                ],
            })
            .unwrap();

        let audio = AudioThread::spawn(host.clone() as Arc<dyn TabHost>).expect("audio thread");
        let mut svc = CoordinatorService::new(host.clone(), audio, config);
        svc.restore_controllers();

        assert!(svc.is_controlled(7));
        assert!(!svc.is_controlled(9));
        // The worker rebuilt a processor for the surviving tab.
        assert_eq!(host.capture_count(), 1);

        match svc.dispatch(Command::GetControlledTabs).unwrap() {
            Reply::ControlledTabs(tabs) => {
                assert_eq!(tabs.len(), 1);
                assert_eq!(tabs[0].current_gain, 250);
            }
            other => panic!("unexpected reply {other:?}"),
        }

        // The cleaned snapshot was re-persisted without the dead entry.
        let config = ConfigManager::with_dir(dir.path().to_path_buf());
        let reloaded = config.load_controllers().unwrap();
        assert_eq!(reloaded.controllers.len(), 1);
        assert_eq!(reloaded.controllers[0].tab_id, 7);
    }

    #[test]
    fn test_popup_state_gates_notifications() {
        let host = Arc::new(MockHost::new());
        host.add_tab(7, "Example", "https://example.com/", true, false);
        let (_dir, mut svc) = service(host);

        let (signal_tx, mut signal_rx) = tokio_mpsc::unbounded_channel();
        svc.set_signal_sender(signal_tx);
        let (tx, rx) = mpsc::channel();
        svc.set_host_event_receiver(rx);

        // Panel closed: audible changes are not forwarded.
        tx.send(HostEvent::TabAudibleChanged {
            tab_id: 7,
            audible: false,
        })
        .unwrap();
        svc.process_host_events();
        assert!(signal_rx.try_recv().is_err());

        svc.dispatch(Command::PopupOpened).unwrap();
        tx.send(HostEvent::TabAudibleChanged {
            tab_id: 7,
            audible: true,
        })
        .unwrap();
        svc.process_host_events();
        assert!(matches!(signal_rx.try_recv(), Ok(SignalEvent::TabsUpdated)));

        svc.dispatch(Command::PopupClosed).unwrap();
        tx.send(HostEvent::TabClosed(7)).unwrap();
        svc.process_host_events();
        assert!(signal_rx.try_recv().is_err());
    }
}
