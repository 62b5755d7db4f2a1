//! Presence status vocabulary.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A user's current availability as reported by the hub.
///
/// Variants are unordered: the most recent authoritative report wins
/// regardless of which status it carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Connected and available.
    Online,
    /// Not connected. Also the reading for users never observed.
    #[default]
    Offline,
    /// Connected but marked busy (in a call, do-not-disturb).
    Busy,
    /// Connected but idle.
    Absent,
}

impl PresenceStatus {
    /// Wire name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Busy => "busy",
            Self::Absent => "absent",
        }
    }

    /// Whether the user holds a live session (anything but `Offline`).
    #[must_use]
    pub fn is_connected(self) -> bool {
        !matches!(self, Self::Offline)
    }
}

impl fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
