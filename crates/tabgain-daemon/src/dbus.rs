// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! D-Bus interface implementation for the daemon.

use crate::service::CoordinatorService;
use std::sync::{Arc, Mutex};
use tabgain_ipc::{Command, ControlledTabInfo, Reply, TabInfo};
use tracing::debug;
use zbus::interface;

/// The D-Bus interface implementation.
pub struct DaemonDbusService {
    service: Arc<Mutex<CoordinatorService>>,
}

impl DaemonDbusService {
    pub fn new(service: Arc<Mutex<CoordinatorService>>) -> Self {
        Self { service }
    }

    /// Run one command against the coordinator, draining pending browser
    /// events first so handlers see a current tab view.
    fn run(&self, command: Command) -> zbus::fdo::Result<Reply> {
        let mut service = self
            .service
            .lock()
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        service.process_host_events();
        service.dispatch(command).map_err(Into::into)
    }
}

#[interface(name = "com.tabgain.Daemon")]
impl DaemonDbusService {
    /// Start volume control for a tab. Returns the tab's domain and the gain
    /// the processor was started at.
    async fn start_volume_control(&self, tab_id: u32) -> zbus::fdo::Result<(String, u32)> {
        debug!("D-Bus: start_volume_control({})", tab_id);
        match self.run(Command::StartVolumeControl { tab_id })? {
            Reply::Started {
                domain,
                default_gain,
            } => Ok((domain, default_gain)),
            other => Err(zbus::fdo::Error::Failed(format!(
                "Unexpected reply: {other:?}"
            ))),
        }
    }

    /// Stop volume control and restore the tab's native mute flag.
    async fn stop_volume_control(&self, tab_id: u32) -> zbus::fdo::Result<()> {
        debug!("D-Bus: stop_volume_control({})", tab_id);
        self.run(Command::StopVolumeControl { tab_id })?;
        Ok(())
    }

    /// Set the gain for a controlled tab (percentage, clamped to 0-600).
    async fn set_volume(&self, tab_id: u32, volume: f64) -> zbus::fdo::Result<()> {
        self.run(Command::SetVolume { tab_id, volume })?;
        Ok(())
    }

    /// Mute or unmute the controlled output of a tab.
    async fn mute_tab(&self, tab_id: u32, muted: bool) -> zbus::fdo::Result<()> {
        debug!("D-Bus: mute_tab({}, {})", tab_id, muted);
        self.run(Command::MuteTab { tab_id, muted })?;
        Ok(())
    }

    /// List audible tabs, flagging the controlled ones.
    async fn get_audible_tabs(&self) -> zbus::fdo::Result<Vec<TabInfo>> {
        match self.run(Command::GetAudibleTabs)? {
            Reply::AudibleTabs(tabs) => Ok(tabs),
            other => Err(zbus::fdo::Error::Failed(format!(
                "Unexpected reply: {other:?}"
            ))),
        }
    }

    /// List tabs currently under volume control.
    async fn get_controlled_tabs(&self) -> zbus::fdo::Result<Vec<ControlledTabInfo>> {
        match self.run(Command::GetControlledTabs)? {
            Reply::ControlledTabs(tabs) => Ok(tabs),
            other => Err(zbus::fdo::Error::Failed(format!(
                "Unexpected reply: {other:?}"
            ))),
        }
    }

    /// Get the saved gain for a domain (unity if none is saved).
    async fn get_domain_gain(&self, domain: String) -> zbus::fdo::Result<u32> {
        match self.run(Command::GetDomainGain { domain })? {
            Reply::DomainGain(gain) => Ok(gain),
            other => Err(zbus::fdo::Error::Failed(format!(
                "Unexpected reply: {other:?}"
            ))),
        }
    }

    /// Save the preferred gain for a domain.
    async fn save_domain_gain(&self, domain: String, gain: f64) -> zbus::fdo::Result<()> {
        debug!("D-Bus: save_domain_gain({}, {})", domain, gain);
        self.run(Command::SaveDomainGain { domain, gain })?;
        Ok(())
    }

    /// The panel opened; tab-change signals are wanted from now on.
    async fn popup_opened(&self) -> zbus::fdo::Result<()> {
        debug!("D-Bus: popup_opened");
        self.run(Command::PopupOpened)?;
        Ok(())
    }

    /// The panel closed; stop emitting tab-change signals.
    async fn popup_closed(&self) -> zbus::fdo::Result<()> {
        debug!("D-Bus: popup_closed");
        self.run(Command::PopupClosed)?;
        Ok(())
    }

    // ==================== Signals ====================

    /// Emitted when the audible or controlled tab set changes while the
    /// panel is open.
    #[zbus(signal)]
    async fn tabs_updated(ctx: &zbus::SignalContext<'_>) -> zbus::Result<()>;
}

/// Emit the TabsUpdated signal from outside the interface methods.
pub async fn emit_tabs_updated(ctx: &zbus::SignalContext<'_>) -> zbus::Result<()> {
    ctx.connection()
        .emit_signal(
            ctx.destination(),
            ctx.path(),
            tabgain_ipc::DBUS_INTERFACE,
            "TabsUpdated",
            &(),
        )
        .await
}
