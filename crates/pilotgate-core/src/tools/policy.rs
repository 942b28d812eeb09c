//! Tool permission policy

use std::collections::HashSet;

use super::error::{ToolError, ToolsResult};
use crate::config::ToolsConfig;
use crate::types::ToolDescriptor;

const WILDCARD: &str = "*";

/// Which tools may be offered to the model and executed.
///
/// A tool must be allowed (wildcard or by name) and not denied. Tools that
/// require approval are refused unless `auto_approve` is set, since there is
/// nobody to ask.
#[derive(Debug, Clone)]
pub struct ToolPolicy {
    /// `None` allows everything
    allow: Option<HashSet<String>>,
    deny: HashSet<String>,
    require_approval: HashSet<String>,
    auto_approve: bool,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self::allow_all()
    }
}

impl ToolPolicy {
    pub fn allow_all() -> Self {
        Self {
            allow: None,
            deny: HashSet::new(),
            require_approval: HashSet::new(),
            auto_approve: false,
        }
    }

    /// Allow only `names`; `"*"` among them allows everything
    pub fn with_allow<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: HashSet<String> = names.into_iter().map(Into::into).collect();
        self.allow = if names.contains(WILDCARD) { None } else { Some(names) };
        self
    }

    pub fn with_deny<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deny = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_require_approval<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.require_approval = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_auto_approve(mut self, auto_approve: bool) -> Self {
        self.auto_approve = auto_approve;
        self
    }

    /// Allowed and not denied
    pub fn is_allowed(&self, name: &str) -> bool {
        if self.deny.contains(name) || self.deny.contains(WILDCARD) {
            return false;
        }
        match &self.allow {
            Some(allow) => allow.contains(name),
            None => true,
        }
    }

    pub fn needs_approval(&self, name: &str) -> bool {
        !self.auto_approve && (self.require_approval.contains(name) || self.require_approval.contains(WILDCARD))
    }

    /// Pre-dispatch check
    pub fn check(&self, name: &str) -> ToolsResult<()> {
        if !self.is_allowed(name) {
            return Err(ToolError::NotPermitted(name.to_string()));
        }
        if self.needs_approval(name) {
            return Err(ToolError::ApprovalRequired(name.to_string()));
        }
        Ok(())
    }

    /// The subset of `tools` the model may be offered
    pub fn filter(&self, tools: Vec<ToolDescriptor>) -> Vec<ToolDescriptor> {
        tools.into_iter().filter(|t| self.check(&t.name).is_ok()).collect()
    }
}

impl From<&ToolsConfig> for ToolPolicy {
    fn from(config: &ToolsConfig) -> Self {
        ToolPolicy::allow_all()
            .with_allow(config.allow.iter().cloned())
            .with_deny(config.deny.iter().cloned())
            .with_require_approval(config.require_approval.iter().cloned())
            .with_auto_approve(config.auto_approve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(name: &str) -> ToolDescriptor {
        ToolDescriptor::new(name, "", json!({}))
    }

    #[test]
    fn test_default_allows_everything() {
        let policy = ToolPolicy::default();
        assert!(policy.check("anything").is_ok());
    }

    #[test]
    fn test_allow_list() {
        let policy = ToolPolicy::allow_all().with_allow(["search"]);
        assert!(policy.check("search").is_ok());
        assert!(matches!(policy.check("delete"), Err(ToolError::NotPermitted(_))));

        let offered = policy.filter(vec![tool("search"), tool("delete")]);
        assert_eq!(offered, vec![tool("search")]);
    }

    #[test]
    fn test_wildcard_with_deny() {
        let policy = ToolPolicy::allow_all().with_allow(["*", "ignored"]).with_deny(["rm"]);
        assert!(policy.is_allowed("grep"));
        assert!(!policy.is_allowed("rm"));
    }

    #[test]
    fn test_approval_policy() {
        let policy = ToolPolicy::allow_all().with_require_approval(["shell"]);
        assert!(matches!(policy.check("shell"), Err(ToolError::ApprovalRequired(_))));
        assert!(policy.filter(vec![tool("shell")]).is_empty());

        let policy = policy.with_auto_approve(true);
        assert!(policy.check("shell").is_ok());
    }

    #[test]
    fn test_from_config() {
        let config = ToolsConfig {
            allow: vec!["search".into()],
            deny: vec![],
            require_approval: vec![],
            auto_approve: false,
        };
        let policy = ToolPolicy::from(&config);
        assert!(policy.is_allowed("search"));
        assert!(!policy.is_allowed("delete"));
    }
}
