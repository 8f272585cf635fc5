//! Safety validator.
//!
//! Classifies a tool call into a risk level before it runs. Classification is
//! a fixed sequence of tiers and the first match wins:
//!
//! 1. allow-list substring → low
//! 2. deny-list substring → high, approval
//! 3. interactive first token → high, approval, interactive
//! 4. dangerous verb substring → medium, approval, modifies resource
//! 5. otherwise → low

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Risk attached to a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        f.write_str(s)
    }
}

/// Verdict for one call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallAnalysis {
    pub is_interactive: bool,
    pub modifies_resource: bool,
    pub requires_approval: bool,
    pub risk_level: RiskLevel,
    pub rationale: String,
}

impl ToolCallAnalysis {
    fn low(rationale: impl Into<String>) -> Self {
        Self {
            is_interactive: false,
            modifies_resource: false,
            requires_approval: false,
            risk_level: RiskLevel::Low,
            rationale: rationale.into(),
        }
    }
}

/// Pattern lists driving the validator. Matching is case-insensitive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafetyConfig {
    #[serde(default)]
    pub allow_patterns: Vec<String>,
    #[serde(default = "default_deny_patterns")]
    pub deny_patterns: Vec<String>,
    #[serde(default = "default_interactive_commands")]
    pub interactive_commands: Vec<String>,
    #[serde(default = "default_dangerous_verbs")]
    pub dangerous_verbs: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            allow_patterns: Vec::new(),
            deny_patterns: default_deny_patterns(),
            interactive_commands: default_interactive_commands(),
            dangerous_verbs: default_dangerous_verbs(),
        }
    }
}

fn default_deny_patterns() -> Vec<String> {
    [":(){", "mkfs", "dd if=", "> /dev/sd", "shred "]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_interactive_commands() -> Vec<String> {
    [
        "vim", "vi", "nano", "emacs", "less", "more", "top", "htop", "ssh", "telnet", "ftp",
        "mysql", "psql", "python", "irb", "node",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_dangerous_verbs() -> Vec<String> {
    [
        "rm ", "delete", "drop ", "truncate", "destroy", "terminate", "kill", "shutdown",
        "reboot", "chmod", "chown", "update ", "insert ", "alter ", "apply", "scale",
        "restart", "write", "create", "remove", "merge", "push",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Stateless classifier over a `SafetyConfig`.
#[derive(Debug, Clone, Default)]
pub struct SafetyValidator {
    allow: Vec<String>,
    deny: Vec<String>,
    interactive: Vec<String>,
    verbs: Vec<String>,
}

impl SafetyValidator {
    pub fn new(config: &SafetyConfig) -> Self {
        let lower = |v: &[String]| v.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>();
        Self {
            allow: lower(&config.allow_patterns),
            deny: lower(&config.deny_patterns),
            interactive: lower(&config.interactive_commands),
            verbs: lower(&config.dangerous_verbs),
        }
    }

    /// Classify a command string.
    pub fn analyze(&self, command: &str) -> ToolCallAnalysis {
        let text = command.trim().to_lowercase();

        if let Some(p) = self.allow.iter().find(|p| text.contains(p.as_str())) {
            return ToolCallAnalysis::low(format!("matches allow-list pattern '{p}'"));
        }

        if let Some(p) = self.deny.iter().find(|p| text.contains(p.as_str())) {
            return ToolCallAnalysis {
                is_interactive: false,
                modifies_resource: true,
                requires_approval: true,
                risk_level: RiskLevel::High,
                rationale: format!("matches deny-list pattern '{p}'"),
            };
        }

        let first = text.split_whitespace().next().unwrap_or("");
        let program = first.rsplit('/').next().unwrap_or(first);
        if !program.is_empty() && self.interactive.iter().any(|c| c == program) {
            return ToolCallAnalysis {
                is_interactive: true,
                modifies_resource: false,
                requires_approval: true,
                risk_level: RiskLevel::High,
                rationale: format!("'{program}' is an interactive program"),
            };
        }

        if let Some(v) = self.verbs.iter().find(|v| text.contains(v.as_str())) {
            return ToolCallAnalysis {
                is_interactive: false,
                modifies_resource: true,
                requires_approval: true,
                risk_level: RiskLevel::Medium,
                rationale: format!("contains resource-modifying verb '{}'", v.trim()),
            };
        }

        ToolCallAnalysis::low("no risky pattern matched")
    }

    /// Classify a tool call by its most command-like argument.
    pub fn analyze_call(&self, tool: &str, arguments: &Value) -> ToolCallAnalysis {
        self.analyze(&extract_command(tool, arguments))
    }
}

/// The text a call is judged by: `command`, `cmd` or `query` argument, else
/// the tool name.
pub fn extract_command(tool: &str, arguments: &Value) -> String {
    ["command", "cmd", "query"]
        .iter()
        .find_map(|key| arguments.get(key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| tool.replace(['_', '-', '.'], " "))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn validator() -> SafetyValidator {
        SafetyValidator::new(&SafetyConfig::default())
    }

    #[test]
    fn test_rm_is_medium_and_modifies() {
        let a = validator().analyze("rm -rf /tmp");
        assert_eq!(a.risk_level, RiskLevel::Medium);
        assert!(a.modifies_resource);
        assert!(a.requires_approval);
        assert!(!a.is_interactive);
    }

    #[test]
    fn test_editor_is_interactive_high() {
        let a = validator().analyze("vim file.txt");
        assert_eq!(a.risk_level, RiskLevel::High);
        assert!(a.is_interactive);
        assert!(a.requires_approval);

        let a = validator().analyze("/usr/bin/vim file.txt");
        assert!(a.is_interactive);
    }

    #[test]
    fn test_read_only_is_low() {
        let a = validator().analyze("list users");
        assert_eq!(a.risk_level, RiskLevel::Low);
        assert!(!a.requires_approval);
    }

    #[test]
    fn test_allow_list_wins_over_verbs() {
        let config = SafetyConfig {
            allow_patterns: vec!["rm -rf /tmp/cache".into()],
            ..SafetyConfig::default()
        };
        let a = SafetyValidator::new(&config).analyze("RM -RF /tmp/cache");
        assert_eq!(a.risk_level, RiskLevel::Low);
        assert!(!a.requires_approval);
    }

    #[test]
    fn test_deny_list_beats_interactive() {
        let a = validator().analyze("sudo mkfs.ext4 /dev/sdb1");
        assert_eq!(a.risk_level, RiskLevel::High);
        assert!(!a.is_interactive);
        assert!(a.requires_approval);
    }

    #[test]
    fn test_verbs_are_case_insensitive() {
        let a = validator().analyze("DROP TABLE users");
        assert_eq!(a.risk_level, RiskLevel::Medium);
    }

    #[test]
    fn test_extract_command_order() {
        assert_eq!(
            extract_command("exec", &json!({"cmd": "ls", "query": "q"})),
            "ls"
        );
        assert_eq!(
            extract_command("exec", &json!({"command": "pwd", "cmd": "ls"})),
            "pwd"
        );
        assert_eq!(extract_command("search_issues", &json!({})), "search issues");
        assert_eq!(extract_command("delete_repo", &json!({"command": 5})), "delete repo");
    }

    #[test]
    fn test_analyze_call_uses_tool_name() {
        let a = validator().analyze_call("delete_branch", &json!({"name": "x"}));
        assert_eq!(a.risk_level, RiskLevel::Medium);
        let a = validator().analyze_call("get_issue", &json!({}));
        assert_eq!(a.risk_level, RiskLevel::Low);
    }

    #[test]
    fn test_risk_display_lowercase() {
        assert_eq!(RiskLevel::High.to_string(), "high");
    }
}
