//! Role-based access control.
//!
//! A role maps to a list of capability patterns. A pattern ending in `*`
//! matches every capability with that prefix (`tool:github_*`, `tool:*`, `*`);
//! anything else must match exactly. Unknown roles have no capabilities.

use std::collections::HashMap;

use crate::mcp_client::errors::McpError;

/// Capability required to invoke a tool.
pub fn tool_capability(tool: &str) -> String {
    format!("tool:{tool}")
}

// ─── PermissionChecker ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct PermissionChecker {
    /// Role → capability patterns.
    roles: HashMap<String, Vec<String>>,
}

impl PermissionChecker {
    pub fn new(roles: HashMap<String, Vec<String>>) -> Self {
        Self { roles }
    }

    /// Whether `role` holds `capability`.
    pub fn check_permission(&self, role: &str, capability: &str) -> bool {
        self.roles
            .get(role)
            .is_some_and(|patterns| patterns.iter().any(|p| pattern_matches(p, capability)))
    }

    /// Like `check_permission` but as a `PermissionDenied` error.
    pub fn require(&self, role: &str, capability: &str) -> Result<(), McpError> {
        if self.check_permission(role, capability) {
            Ok(())
        } else {
            Err(McpError::PermissionDenied {
                role: role.to_string(),
                capability: capability.to_string(),
            })
        }
    }

    /// Add a capability pattern to a role, creating the role if needed.
    pub fn grant(&mut self, role: &str, pattern: &str) {
        let patterns = self.roles.entry(role.to_string()).or_default();
        if !patterns.iter().any(|p| p == pattern) {
            patterns.push(pattern.to_string());
        }
    }

    /// Remove a pattern. Returns true if it was present.
    pub fn revoke(&mut self, role: &str, pattern: &str) -> bool {
        match self.roles.get_mut(role) {
            Some(patterns) => {
                let before = patterns.len();
                patterns.retain(|p| p != pattern);
                patterns.len() != before
            }
            None => false,
        }
    }

    /// Role names, sorted.
    pub fn roles(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.roles.keys().map(|k| k.as_str()).collect();
        names.sort();
        names
    }
}

fn pattern_matches(pattern: &str, capability: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => capability.starts_with(prefix),
        None => pattern == capability,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
