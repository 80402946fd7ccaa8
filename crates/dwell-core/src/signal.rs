//! Raw browser signals and the normalized transitions derived from them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ActivityKey;

/// The kind of raw signal reported by the browser runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// A tab became the active tab.
    Activate,
    /// The active tab navigated or changed URL.
    Update,
    /// A browser window gained focus.
    Focus,
    /// A browser window lost focus.
    Blur,
    /// The page became visible.
    Visible,
    /// The page became hidden.
    Hidden,
    /// The system reported the user idle.
    Idle,
    /// User activity resumed, or the system woke from sleep.
    Resume,
}

impl SignalKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Update => "update",
            Self::Focus => "focus",
            Self::Blur => "blur",
            Self::Visible => "visible",
            Self::Hidden => "hidden",
            Self::Idle => "idle",
            Self::Resume => "resume",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalKind {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "activate" => Ok(Self::Activate),
            "update" => Ok(Self::Update),
            "focus" => Ok(Self::Focus),
            "blur" => Ok(Self::Blur),
            "visible" => Ok(Self::Visible),
            "hidden" => Ok(Self::Hidden),
            "idle" => Ok(Self::Idle),
            "resume" => Ok(Self::Resume),
            _ => Err(SignalError::UnknownKind(s.to_string())),
        }
    }
}

/// A signal that could not be turned into a transition.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    #[error("unknown signal kind: {0}")]
    UnknownKind(String),
    /// `activate`/`update` must name the activity they refer to.
    #[error("{0} signal requires an activity key")]
    MissingKey(SignalKind),
    #[error("{kind} signal has an invalid activity key: {reason}")]
    InvalidKey { kind: SignalKind, reason: String },
}

/// A raw signal as delivered by the browser runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawSignal {
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity_key: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl RawSignal {
    pub fn new(kind: SignalKind, activity_key: Option<&str>, observed_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            activity_key: activity_key.map(str::to_string),
            observed_at,
        }
    }

    /// Validates the activity key, if any.
    pub fn key(&self) -> Result<Option<ActivityKey>, SignalError> {
        self.activity_key
            .as_deref()
            .map(|key| {
                ActivityKey::new(key).map_err(|err| SignalError::InvalidKey {
                    kind: self.kind,
                    reason: err.to_string(),
                })
            })
            .transpose()
    }

    /// Maps the signal onto the session state machine's vocabulary.
    pub fn normalize(&self) -> Result<Transition, SignalError> {
        let key = self.key()?;
        let transition = match (self.kind, key) {
            (SignalKind::Activate | SignalKind::Update, Some(key))
            | (SignalKind::Focus | SignalKind::Visible, Some(key)) => Transition::Start(key),
            (SignalKind::Activate | SignalKind::Update, None) => {
                return Err(SignalError::MissingKey(self.kind));
            }
            (SignalKind::Focus | SignalKind::Visible | SignalKind::Resume, _) => Transition::Resume,
            (SignalKind::Blur | SignalKind::Hidden, _) => Transition::SwitchAway,
            (SignalKind::Idle, _) => Transition::InactivityTimeout,
        };
        Ok(transition)
    }
}

/// A normalized input to the session state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The user is now engaged with the given activity.
    Start(ActivityKey),
    /// Periodic accrual tick.
    Heartbeat,
    /// The user left the current activity.
    SwitchAway,
    /// Tracking ended (disable, shutdown).
    Close,
    /// The user went idle.
    InactivityTimeout,
    /// The user is back (activity, focus regain, wake from sleep).
    Resume,
    /// The paused session has been paused too long.
    StaleTimeout,
}

impl Transition {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Start(_) => "start",
            Self::Heartbeat => "heartbeat",
            Self::SwitchAway => "switch_away",
            Self::Close => "close",
            Self::InactivityTimeout => "inactivity_timeout",
            Self::Resume => "resume",
            Self::StaleTimeout => "stale_timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal(kind: SignalKind, key: Option<&str>) -> RawSignal {
        RawSignal::new(kind, key, Utc::now())
    }

    #[test]
    fn activate_with_key_starts() {
        let transition = signal(SignalKind::Activate, Some("github.com"))
            .normalize()
            .unwrap();
        assert_eq!(
            transition,
            Transition::Start(ActivityKey::new("github.com").unwrap())
        );
    }

    #[test]
    fn activate_without_key_is_rejected() {
        assert_eq!(
            signal(SignalKind::Update, None).normalize(),
            Err(SignalError::MissingKey(SignalKind::Update))
        );
    }

    #[test]
    fn empty_key_is_rejected() {
        assert!(matches!(
            signal(SignalKind::Activate, Some("")).normalize(),
            Err(SignalError::InvalidKey { .. })
        ));
    }

    #[test]
    fn keyless_focus_is_a_resume() {
        assert_eq!(
            signal(SignalKind::Visible, None).normalize().unwrap(),
            Transition::Resume
        );
        assert_eq!(
            signal(SignalKind::Resume, Some("ignored.example")).normalize().unwrap(),
            Transition::Resume
        );
    }

    #[test]
    fn blur_hidden_and_idle_map_to_stop_and_pause() {
        assert_eq!(
            signal(SignalKind::Blur, None).normalize().unwrap(),
            Transition::SwitchAway
        );
        assert_eq!(
            signal(SignalKind::Hidden, Some("a.com")).normalize().unwrap(),
            Transition::SwitchAway
        );
        assert_eq!(
            signal(SignalKind::Idle, None).normalize().unwrap(),
            Transition::InactivityTimeout
        );
    }

    #[test]
    fn raw_signal_parses_wire_format() {
        let json = r#"{"kind":"activate","activityKey":"docs.rs","observedAt":"2025-01-01T00:00:00Z"}"#;
        let parsed: RawSignal = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.kind, SignalKind::Activate);
        assert_eq!(parsed.activity_key.as_deref(), Some("docs.rs"));
    }

    #[test]
    fn signal_kind_from_str_rejects_unknown() {
        assert_eq!("blur".parse::<SignalKind>().unwrap(), SignalKind::Blur);
        assert!("scroll".parse::<SignalKind>().is_err());
    }
}
