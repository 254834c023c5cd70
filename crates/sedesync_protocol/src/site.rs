//! Sites.

use crate::error::ProtocolError;
use crate::ids::SiteId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The closed set of known site codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SiteCode {
    /// The central site, usually the hub.
    Central,
    /// Northern site.
    Norte,
    /// Southern site.
    Sur,
    /// Eastern site.
    Oriente,
    /// Western site.
    Occidente,
}

impl SiteCode {
    /// Every known code.
    pub const ALL: [SiteCode; 5] = [
        SiteCode::Central,
        SiteCode::Norte,
        SiteCode::Sur,
        SiteCode::Oriente,
        SiteCode::Occidente,
    ];

    /// Returns the canonical upper-case code.
    pub fn as_str(&self) -> &'static str {
        match self {
            SiteCode::Central => "CENTRAL",
            SiteCode::Norte => "NORTE",
            SiteCode::Sur => "SUR",
            SiteCode::Oriente => "ORIENTE",
            SiteCode::Occidente => "OCCIDENTE",
        }
    }
}

impl fmt::Display for SiteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SiteCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        SiteCode::ALL
            .into_iter()
            .find(|code| code.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ProtocolError::UnknownSiteCode(s.to_string()))
    }
}

/// An independently operating location with its own data store.
///
/// Sites are provisioned administratively and never deleted, only
/// deactivated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    /// Globally unique identifier.
    pub id: SiteId,
    /// Human code.
    pub code: SiteCode,
    /// Display name.
    pub name: String,
    /// Whether the site still takes part in synchronization.
    pub active: bool,
}

impl Site {
    /// Provisions a new active site with a fresh identifier.
    pub fn new(code: SiteCode, name: impl Into<String>) -> Self {
        Self {
            id: SiteId::new(),
            code,
            name: name.into(),
            active: true,
        }
    }

    /// Builds a site with a known identifier.
    pub fn with_id(id: SiteId, code: SiteCode, name: impl Into<String>) -> Self {
        Self {
            id,
            code,
            name: name.into(),
            active: true,
        }
    }

    /// Marks the site inactive.
    pub fn deactivate(&mut self) {
        self.active = false;
    }
}

impl fmt::Display for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.code, self.name)
    }
}
