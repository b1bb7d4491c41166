// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared IPC types and D-Bus interface definitions for Tabgain.
//!
//! This crate defines the communication protocol between the Tabgain daemon,
//! the panel UI client, and the browser bridge, all via D-Bus.

use serde::{Deserialize, Serialize};
use zbus::zvariant::Type;

/// D-Bus service name for the Tabgain daemon.
pub const DBUS_NAME: &str = "com.tabgain.Daemon";

/// D-Bus object path for the main daemon interface.
pub const DBUS_PATH: &str = "/com/tabgain/Daemon";

/// D-Bus interface name.
pub const DBUS_INTERFACE: &str = "com.tabgain.Daemon";

/// D-Bus service name of the browser bridge the daemon consumes.
pub const BRIDGE_NAME: &str = "com.tabgain.Browser";

/// D-Bus object path of the browser bridge.
pub const BRIDGE_PATH: &str = "/com/tabgain/Browser";

/// Lowest accepted gain percentage.
pub const GAIN_MIN: u32 = 0;

/// Highest accepted gain percentage (6x boost).
pub const GAIN_MAX: u32 = 600;

/// Unity gain, used as the fallback for unparseable input.
pub const GAIN_DEFAULT: u32 = 100;

/// Clamp a raw gain value into the valid percentage range.
///
/// Fractional values truncate toward zero; `None` and non-finite values fall
/// back to unity. Zero is a valid gain and is preserved.
pub fn clamp_gain(raw: Option<f64>) -> u32 {
    let value = match raw {
        Some(v) if v.is_finite() => v.trunc(),
        _ => return GAIN_DEFAULT,
    };
    if value < GAIN_MIN as f64 {
        GAIN_MIN
    } else if value > GAIN_MAX as f64 {
        GAIN_MAX
    } else {
        value as u32
    }
}

/// Parse a textual gain the way panel inputs submit it: an optional sign
/// followed by a leading run of digits, anything else falling back to unity.
pub fn parse_gain(raw: &str) -> u32 {
    let trimmed = raw.trim();
    let (negative, digits) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
    };

    let run: String = digits.chars().take_while(|c| c.is_ascii_digit()).collect();
    if run.is_empty() {
        return GAIN_DEFAULT;
    }

    // The run is capped well below i64 range in practice, but saturate anyway.
    let value = run.parse::<i64>().unwrap_or(i64::MAX);
    clamp_gain(Some(if negative { -value } else { value } as f64))
}

/// Information about an audible tab, as shown in the panel's tab list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct TabInfo {
    /// Tab identifier assigned by the browser.
    pub id: u32,
    /// Sanitized tab title.
    pub title: String,
    /// Full tab URL.
    pub url: String,
    /// Sanitized hostname ("unknown" if the URL does not parse).
    pub domain: String,
    /// Whether the tab is currently under volume control.
    pub controlled: bool,
}

/// Information about a tab under active volume control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct ControlledTabInfo {
    /// Tab identifier assigned by the browser.
    pub id: u32,
    /// Sanitized tab title.
    pub title: String,
    /// Sanitized hostname captured when control started.
    pub domain: String,
    /// Current gain percentage (100 = unity).
    pub current_gain: u32,
    /// Whether the controlled output is muted.
    pub is_muted: bool,
}

/// Raw tab state as reported by the browser bridge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Type)]
pub struct TabSnapshot {
    /// Tab identifier assigned by the browser.
    pub id: u32,
    /// Unsanitized tab title.
    pub title: String,
    /// Full tab URL.
    pub url: String,
    /// Whether the tab is currently producing audio.
    pub audible: bool,
    /// The tab's native mute flag.
    pub muted: bool,
}

/// A command accepted by the coordinator, one variant per panel action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Command {
    StartVolumeControl { tab_id: u32 },
    StopVolumeControl { tab_id: u32 },
    SetVolume { tab_id: u32, volume: f64 },
    MuteTab { tab_id: u32, muted: bool },
    GetAudibleTabs,
    GetControlledTabs,
    GetDomainGain { domain: String },
    SaveDomainGain { domain: String, gain: f64 },
    PopupOpened,
    PopupClosed,
}

/// Successful outcome of a [`Command`].
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Control started (or was already active): domain and effective gain.
    Started { domain: String, default_gain: u32 },
    /// Plain acknowledgement.
    Ack,
    AudibleTabs(Vec<TabInfo>),
    ControlledTabs(Vec<ControlledTabInfo>),
    DomainGain(u32),
}

/// Error taxonomy for coordinator operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ControlError {
    #[error("Tab {0} is not under volume control")]
    NotControlled(u32),
    #[error("Tab {0} is not playing audio")]
    NotAudible(u32),
    #[error("A capture session is already active for tab {0}")]
    CaptureConflict(u32),
    #[error("Invalid domain")]
    InvalidDomain,
    #[error("Host call failed: {0}")]
    HostCall(String),
}

impl From<ControlError> for zbus::fdo::Error {
    fn from(e: ControlError) -> Self {
        zbus::fdo::Error::Failed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_gain_range() {
        assert_eq!(clamp_gain(Some(0.0)), 0);
        assert_eq!(clamp_gain(Some(-50.0)), 0);
        assert_eq!(clamp_gain(Some(700.0)), 600);
        assert_eq!(clamp_gain(Some(250.0)), 250);
    }

    #[test]
    fn test_clamp_gain_truncates() {
        assert_eq!(clamp_gain(Some(150.7)), 150);
        assert_eq!(clamp_gain(Some(-0.4)), 0);
    }

    #[test]
    fn test_clamp_gain_fallback() {
        assert_eq!(clamp_gain(None), 100);
        assert_eq!(clamp_gain(Some(f64::NAN)), 100);
        assert_eq!(clamp_gain(Some(f64::INFINITY)), 100);
    }

    #[test]
    fn test_parse_gain() {
        assert_eq!(parse_gain("250"), 250);
        assert_eq!(parse_gain("0"), 0);
        assert_eq!(parse_gain("  150  "), 150);
        assert_eq!(parse_gain("150.7"), 150);
        assert_eq!(parse_gain("-50"), 0);
        assert_eq!(parse_gain("abc"), 100);
        assert_eq!(parse_gain(""), 100);
        assert_eq!(parse_gain("99999999999999999999"), 600);
    }

    #[test]
    fn test_command_wire_format() {
        let cmd: Command = serde_json::from_str(
            r#"{"action":"setVolume","tabId":7,"volume":250.0}"#,
        )
        .expect("valid command");
        assert_eq!(
            cmd,
            Command::SetVolume {
                tab_id: 7,
                volume: 250.0
            }
        );
    }

    #[test]
    fn test_control_error_messages() {
        assert_eq!(
            ControlError::NotControlled(3).to_string(),
            "Tab 3 is not under volume control"
        );
        let fdo: zbus::fdo::Error = ControlError::InvalidDomain.into();
        assert!(fdo.to_string().contains("Invalid domain"));
    }
}
