//! Governance applied before any tool runs: who may call it, how often, and
//! the audit record of what happened.

pub mod audit;
pub mod budget;
pub mod enforcer;
pub mod permissions;

pub use audit::{hash_arguments, AuditConfig, AuditEntry, AuditLog, AuditStatus};
pub use budget::{BudgetConfig, BudgetManager, BudgetPermit, RateLimit, ToolBudget};
pub use enforcer::Enforcer;
pub use permissions::{tool_capability, PermissionChecker};
