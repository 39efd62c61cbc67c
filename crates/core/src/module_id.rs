//! Module id grammar: `<name><version><qualifier>`.
//!
//! The name is made of lowercase letters, hyphens and underscores and ends right
//! before the first digit; the version starts at that digit and keeps the rest of
//! the id (`19.3.0`, `2.1.0-SNAPSHOT.117`). Anything else is malformed.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::RolloutError;
use crate::SIDECAR_SUFFIX;

/// Platform-reserved id that is never resolved nor registered.
pub const RESERVED_MODULE_ID: &str = "okapi";

static MODULE_ID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?P<name>[a-z_-]+)(?P<version>[0-9][A-Za-z0-9._-]*)$").expect("valid module id regex"));

/// Name and version parsed out of a module id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleId {
    pub name: String,
    pub version: String,
}

/// Outcome of parsing an id that is not malformed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(ModuleId),
    Reserved,
}

impl ModuleId {
    pub fn parse(raw: &str) -> Result<Resolution, RolloutError> {
        if raw == RESERVED_MODULE_ID {
            return Ok(Resolution::Reserved);
        }
        let malformed = || RolloutError::MalformedIdentifier { id: raw.to_string() };
        let caps = MODULE_ID.captures(raw).ok_or_else(malformed)?;
        let name = trim_markers(&caps["name"]);
        if name.is_empty() {
            return Err(malformed());
        }
        Ok(Resolution::Resolved(ModuleId { name: name.to_string(), version: caps["version"].to_string() }))
    }

    /// Parse an id that must resolve; the reserved id is reported as malformed here.
    pub fn parse_required(raw: &str) -> Result<ModuleId, RolloutError> {
        match Self::parse(raw)? {
            Resolution::Resolved(id) => Ok(id),
            Resolution::Reserved => Err(RolloutError::MalformedIdentifier { id: raw.to_string() }),
        }
    }

    pub fn sidecar_name(&self) -> String {
        format!("{}{}", self.name, SIDECAR_SUFFIX)
    }
}

fn trim_markers(name: &str) -> &str {
    name.trim_matches(|c| c == '-' || c == '_')
}
