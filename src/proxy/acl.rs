//! Allow-list evaluation engine.
//!
//! This module implements the ACL engine that gates every destination the
//! proxy is asked to reach. Rules are regular expressions in two disjoint
//! sets:
//!
//! - Host rules, matched against the bare hostname (`api.example.com`)
//! - URL rules, matched against the full request URL (`https://api.example.com/v1`)
//!
//! # Evaluation Order
//!
//! 1. Any host rule matches the hostname: allow
//! 2. Any URL rule matches the URL: allow
//! 3. Otherwise: deny
//!
//! Both sets are consulted on every check, in this order, regardless of which
//! set was populated at load time. An engine with no rules denies everything.
//!
//! Patterns are unanchored unless written with `^`/`$`, exactly as the regex
//! engine interprets them.
//!
//! # Example
//!
//! ```ignore
//! use egress_proxy::proxy::acl::{AclDecision, AclEngine};
//!
//! let acl = AclEngine::load(&[r"^internal\.example\.com$".into()], &[])?;
//!
//! match acl.check("internal.example.com", "https://internal.example.com/") {
//!     AclDecision::Allow { pattern, .. } => println!("Allowed by {}", pattern),
//!     AclDecision::Deny => println!("Denied"),
//! }
//! ```

use super::error::AclError;
use regex::Regex;
use std::fmt;
use tracing::debug;

/// Which rule set produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    /// Matched against the hostname.
    Host,
    /// Matched against the full URL.
    Url,
}

impl fmt::Display for RuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKind::Host => write!(f, "host"),
            RuleKind::Url => write!(f, "url"),
        }
    }
}

/// A single compiled allow rule.
#[derive(Debug, Clone)]
pub struct AllowRule {
    /// Rule set this rule belongs to.
    pub kind: RuleKind,
    /// Compiled pattern.
    pub pattern: Regex,
}

/// Result of ACL evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclDecision {
    /// The destination matched a rule.
    Allow {
        /// Rule set that matched.
        kind: RuleKind,
        /// Source text of the matching pattern.
        pattern: String,
    },
    /// No rule matched.
    Deny,
}

impl AclDecision {
    /// Check if the decision allows the destination.
    pub fn is_allowed(&self) -> bool {
        matches!(self, AclDecision::Allow { .. })
    }
}

/// Compiled, immutable allow-list.
///
/// Built once at startup and shared read-only by every connection.
#[derive(Debug, Clone, Default)]
pub struct AclEngine {
    host_rules: Vec<AllowRule>,
    url_rules: Vec<AllowRule>,
}

impl AclEngine {
    /// Compile host and URL patterns.
    ///
    /// # Errors
    ///
    /// Returns [`AclError::InvalidPattern`] naming the first pattern that
    /// fails to compile.
    pub fn load(host_patterns: &[String], url_patterns: &[String]) -> Result<Self, AclError> {
        let host_rules = compile(RuleKind::Host, host_patterns)?;
        let url_rules = compile(RuleKind::Url, url_patterns)?;

        debug!(
            "Loaded ACL with {} host rules and {} url rules",
            host_rules.len(),
            url_rules.len()
        );

        Ok(Self {
            host_rules,
            url_rules,
        })
    }

    /// Evaluate a destination.
    ///
    /// Host rules are tried against `hostname` first, then URL rules against
    /// `url`. The first match wins.
    pub fn check(&self, hostname: &str, url: &str) -> AclDecision {
        if let Some(rule) = first_match(&self.host_rules, hostname) {
            debug!("ACL allow: host {} matched {}", hostname, rule.pattern);
            return allow(rule);
        }

        if let Some(rule) = first_match(&self.url_rules, url) {
            debug!("ACL allow: url {} matched {}", url, rule.pattern);
            return allow(rule);
        }

        debug!("ACL deny: host {} url {}", hostname, url);
        AclDecision::Deny
    }

    /// Decide whether a CONNECT tunnel to `host` may be opened.
    ///
    /// Only the hostname is known before TLS is terminated, so URL rules
    /// cannot be matched yet. A tunnel is admitted when a host rule matches
    /// or when any URL rule exists; the decrypted request is then checked
    /// in full by the tunnel terminator.
    pub fn may_tunnel(&self, host: &str) -> AclDecision {
        if let Some(rule) = first_match(&self.host_rules, host) {
            debug!("ACL tunnel allow: host {} matched {}", host, rule.pattern);
            return allow(rule);
        }

        if let Some(rule) = self.url_rules.first() {
            debug!("ACL tunnel deferred to url rules for {}", host);
            return allow(rule);
        }

        debug!("ACL tunnel deny: host {}", host);
        AclDecision::Deny
    }

    /// Get the number of host rules.
    pub fn host_rule_count(&self) -> usize {
        self.host_rules.len()
    }

    /// Get the number of URL rules.
    pub fn url_rule_count(&self) -> usize {
        self.url_rules.len()
    }

    /// Check if no rules are configured (everything is denied).
    pub fn is_empty(&self) -> bool {
        self.host_rules.is_empty() && self.url_rules.is_empty()
    }
}

fn compile(kind: RuleKind, patterns: &[String]) -> Result<Vec<AllowRule>, AclError> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p)
                .map(|pattern| AllowRule { kind, pattern })
                .map_err(|source| AclError::InvalidPattern {
                    kind: match kind {
                        RuleKind::Host => "host",
                        RuleKind::Url => "url",
                    },
                    pattern: p.clone(),
                    source,
                })
        })
        .collect()
}

fn first_match<'a>(rules: &'a [AllowRule], value: &str) -> Option<&'a AllowRule> {
    rules.iter().find(|r| r.pattern.is_match(value))
}

fn allow(rule: &AllowRule) -> AclDecision {
    AclDecision::Allow {
        kind: rule.kind,
        pattern: rule.pattern.as_str().to_string(),
    }
}
