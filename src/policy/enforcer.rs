//! Policy enforcer: RBAC, budgets and the audit trail behind one handle.

use std::collections::HashMap;
use std::sync::Arc;

use crate::mcp_client::errors::McpError;

use super::audit::{AuditEntry, AuditLog};
use super::budget::{BudgetManager, BudgetPermit, ToolBudget};
use super::permissions::{tool_capability, PermissionChecker};

pub struct Enforcer {
    permissions: PermissionChecker,
    budgets: BudgetManager,
    audit: Arc<AuditLog>,
}

impl Enforcer {
    pub fn new(permissions: PermissionChecker, budgets: BudgetManager, audit: Arc<AuditLog>) -> Self {
        Self {
            permissions,
            budgets,
            audit,
        }
    }

    /// Build from the `roles` and `budgets` config sections.
    pub fn from_config(
        roles: HashMap<String, Vec<String>>,
        budgets: super::budget::BudgetConfig,
        audit: Arc<AuditLog>,
    ) -> Result<Self, McpError> {
        Ok(Self::new(
            PermissionChecker::new(roles),
            BudgetManager::new(budgets)?,
            audit,
        ))
    }

    pub fn check_permission(&self, role: &str, capability: &str) -> bool {
        self.permissions.check_permission(role, capability)
    }

    /// `PermissionDenied` unless `role` may call `tool`.
    pub fn authorize_tool(&self, role: &str, tool: &str) -> Result<(), McpError> {
        self.permissions.require(role, &tool_capability(tool))
    }

    /// Admit a call under an explicit budget.
    pub async fn apply_budget(&self, tool: &str, budget: &ToolBudget) -> Result<BudgetPermit, McpError> {
        self.budgets.apply_budget(tool, budget).await
    }

    /// Admit a call under the tool's configured budget.
    pub async fn admit(&self, tool: &str) -> Result<BudgetPermit, McpError> {
        self.budgets.acquire(tool).await
    }

    pub fn budget_for(&self, tool: &str) -> ToolBudget {
        self.budgets.budget_for(tool)
    }

    pub async fn record_invocation(&self, entry: &AuditEntry) -> Result<(), McpError> {
        self.audit.record(entry).await
    }

    pub fn audit_log(&self) -> &Arc<AuditLog> {
        &self.audit
    }
}
