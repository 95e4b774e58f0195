//! Per-attempt authentication state and the events it publishes.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Where the user completes the BankID handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceMode {
    /// Deep link into the BankID app on the same device.
    SameDevice,
    /// QR code scanned with another device.
    OtherDevice,
}

impl fmt::Display for DeviceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceMode::SameDevice => f.write_str("same-device"),
            DeviceMode::OtherDevice => f.write_str("other-device"),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Unknown device mode {0:?} (expected same-device or other-device)")]
pub struct ParseDeviceModeError(String);

impl FromStr for DeviceMode {
    type Err = ParseDeviceModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "same-device" | "same" => Ok(DeviceMode::SameDevice),
            "other-device" | "other" | "qr" => Ok(DeviceMode::OtherDevice),
            _ => Err(ParseDeviceModeError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthPhase {
    AwaitingScan,
    InProgress,
    Expired,
    Authenticated,
    Failed,
}

impl AuthPhase {
    fn is_terminal(self) -> bool {
        matches!(self, AuthPhase::Authenticated | AuthPhase::Failed)
    }
}

/// Snapshot of one login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationState {
    pub qr_token: Option<String>,
    pub auto_start_token: Option<String>,
    pub phase: AuthPhase,
    pub mode: DeviceMode,
}

/// Notifications for the surrounding service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "kebab-case")]
pub enum AuthEvent {
    QrTokenUpdated(String),
    SameDeviceTokenAvailable(String),
    AuthExpired(String),
}

/// A requested change to [`AuthenticationState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateUpdate {
    QrToken(String),
    AutoStartToken(String),
    Phase(AuthPhase),
    Expired(String),
}

/// Shared handle to the state of one login attempt.
///
/// Every change goes through [`AuthStateHandle::apply`], which performs the
/// no-op check and publishes the matching event under the same lock.
pub struct AuthStateHandle {
    state: Mutex<AuthenticationState>,
    events: broadcast::Sender<AuthEvent>,
}

impl AuthStateHandle {
    pub fn new(mode: DeviceMode, events: broadcast::Sender<AuthEvent>) -> Self {
        Self {
            state: Mutex::new(AuthenticationState {
                qr_token: None,
                auto_start_token: None,
                phase: AuthPhase::AwaitingScan,
                mode,
            }),
            events,
        }
    }

    /// Apply `update`, returning whether anything changed.
    pub fn apply(&self, update: StateUpdate) -> bool {
        let mut state = self.state.lock().expect("auth state lock poisoned");
        let event = match update {
            StateUpdate::QrToken(token) => {
                if token.is_empty() || state.qr_token.as_deref() == Some(token.as_str()) {
                    return false;
                }
                state.qr_token = Some(token.clone());
                if !state.phase.is_terminal() {
                    state.phase = AuthPhase::AwaitingScan;
                }
                Some(AuthEvent::QrTokenUpdated(token))
            }
            StateUpdate::AutoStartToken(token) => {
                if token.is_empty() || state.auto_start_token.is_some() {
                    return false;
                }
                state.auto_start_token = Some(token.clone());
                Some(AuthEvent::SameDeviceTokenAvailable(token))
            }
            StateUpdate::Phase(phase) => {
                if state.phase == phase || state.phase.is_terminal() {
                    return false;
                }
                // Only a new QR token leaves Expired, short of a terminal phase.
                if state.phase == AuthPhase::Expired && !phase.is_terminal() {
                    return false;
                }
                state.phase = phase;
                None
            }
            StateUpdate::Expired(message) => {
                if state.phase == AuthPhase::Expired || state.phase.is_terminal() {
                    return false;
                }
                state.phase = AuthPhase::Expired;
                Some(AuthEvent::AuthExpired(message))
            }
        };

        if let Some(event) = event {
            // No subscribers is fine; observers are fire-and-forget.
            let _ = self.events.send(event);
        }
        true
    }

    pub fn snapshot(&self) -> AuthenticationState {
        self.state.lock().expect("auth state lock poisoned").clone()
    }

    /// Whether the backend has issued any token during this attempt.
    pub fn token_observed(&self) -> bool {
        let state = self.state.lock().expect("auth state lock poisoned");
        state.qr_token.is_some() || state.auto_start_token.is_some()
    }
}
