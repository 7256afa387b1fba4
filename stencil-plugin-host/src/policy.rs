//! Access policy for plugin capabilities
//!
//! Tracks which filesystem capabilities have been granted to the plugins of
//! one package. Pure decision logic; the sandbox consults the policy when
//! building its mount list, and the CLI consults it to decide whether a
//! human needs to be prompted for consent.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

/// A capability a plugin may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Access to all resources.
    All,
    /// Read access to the CWD and all subdirectories.
    CwdRo,
}

impl Permission {
    /// All known permissions, for CLI help text.
    pub fn all() -> &'static [Permission] {
        &[Permission::All, Permission::CwdRo]
    }

    /// User-facing description. Starts lowercase, no trailing punctuation.
    pub fn description(self) -> &'static str {
        match self {
            Permission::All => "access to all resources",
            Permission::CwdRo => "read access to the CWD and all subdirectories",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::All => f.write_str("all"),
            Permission::CwdRo => f.write_str("cwd_ro"),
        }
    }
}

impl FromStr for Permission {
    type Err = UnknownPermission;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(Permission::All),
            "cwd_ro" => Ok(Permission::CwdRo),
            other => Err(UnknownPermission(other.to_string())),
        }
    }
}

/// Error returned when parsing an unrecognized permission name.
#[derive(Debug, thiserror::Error)]
#[error("{0} is not a valid permission")]
pub struct UnknownPermission(pub String);

/// Usage lines for a set of permissions, one per entry.
pub fn permission_usage_list(perms: &[Permission]) -> Vec<String> {
    perms
        .iter()
        .map(|p| format!("* {p}: Grant plugins {}.", p.description()))
        .collect()
}

/// The set of capabilities granted to a package's plugins.
///
/// Created per add-operation, mutated only by [`grant`](Self::grant), and
/// discarded once the operation completes.
#[derive(Debug, Clone, Default)]
pub struct PluginAccessPolicy {
    granted: HashSet<Permission>,
}

impl PluginAccessPolicy {
    pub fn new(granted: impl IntoIterator<Item = Permission>) -> Self {
        Self {
            granted: granted.into_iter().collect(),
        }
    }

    /// Returns the subset of `requested` not already granted.
    ///
    /// If the wildcard [`Permission::All`] is granted, nothing is denied.
    pub fn diff(&self, requested: &[Permission]) -> Vec<Permission> {
        if self.granted.contains(&Permission::All) {
            return Vec::new();
        }

        requested
            .iter()
            .copied()
            .filter(|p| !self.granted.contains(p))
            .collect()
    }

    /// Idempotently adds capabilities.
    pub fn grant(&mut self, perms: impl IntoIterator<Item = Permission>) {
        self.granted.extend(perms);
    }

    /// True if `perm` or the wildcard has been granted.
    pub fn authorize(&self, perm: Permission) -> bool {
        self.granted.contains(&perm) || self.granted.contains(&Permission::All)
    }
}
