use crate::core::{ProxyError, Result};
use regex::RegexSet;

/// Allow/deny screen applied to every SQL-bearing command of a session.
///
/// Deny patterns win. When allow patterns exist, SQL must match one of them.
#[derive(Debug, Clone)]
pub struct QueryFilter {
    allow: Option<RegexSet>,
    deny: Option<RegexSet>,
}

impl QueryFilter {
    pub fn new(allow: &[String], deny: &[String]) -> Result<Self> {
        Ok(Self {
            allow: compile(allow)?,
            deny: compile(deny)?,
        })
    }

    /// Filter letting everything through.
    pub fn permissive() -> Self {
        Self {
            allow: None,
            deny: None,
        }
    }

    pub fn is_permissive(&self) -> bool {
        self.allow.is_none() && self.deny.is_none()
    }

    pub fn check(&self, sql: &str) -> Result<()> {
        if let Some(deny) = &self.deny {
            if let Some(index) = deny.matches(sql).iter().next() {
                return Err(ProxyError::Rejected(format!(
                    "query matches deny pattern '{}'",
                    deny.patterns()[index]
                )));
            }
        }
        if let Some(allow) = &self.allow {
            if !allow.is_match(sql) {
                return Err(ProxyError::Rejected(
                    "query matches no allow pattern".to_string(),
                ));
            }
        }
        Ok(())
    }
}

impl Default for QueryFilter {
    fn default() -> Self {
        Self::permissive()
    }
}

fn compile(patterns: &[String]) -> Result<Option<RegexSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    RegexSet::new(patterns)
        .map(Some)
        .map_err(|e| ProxyError::Config(format!("invalid query pattern: {}", e)))
}
