//! Capability rule registry: the complete set of upstream operations the
//! browser may trigger, keyed by upstream.
//!
//! Review this file whenever an upstream gains a new mutating operation.
//! An operation declared with no targets stays listed but permits nothing.

use serde::Serialize;

use crate::error::ApiError;

/// How a target identifier is matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "match", content = "value", rename_all = "snake_case")]
pub enum TargetMatch {
    /// Target starts with the given prefix.
    Prefix(&'static str),
    /// Target equals one of the listed identifiers.
    OneOf(&'static [&'static str]),
}

impl TargetMatch {
    pub fn matches(&self, target: &str) -> bool {
        match self {
            TargetMatch::Prefix(prefix) => target.starts_with(prefix),
            TargetMatch::OneOf(ids) => ids.contains(&target),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CapabilityRule {
    pub domain: &'static str,
    pub operation: &'static str,
    pub targets: &'static [TargetMatch],
}

impl CapabilityRule {
    /// `domain/operation`, the identifier used in messages and listings.
    pub fn key(&self) -> String {
        format!("{}/{}", self.domain, self.operation)
    }

    pub fn permits(&self, target: &str) -> bool {
        self.targets.iter().any(|t| t.matches(target))
    }
}

/// Fan-out settings for an upstream that accepts broadcast commands.
#[derive(Debug, Serialize)]
pub struct Broadcast {
    /// Target value that selects every known target.
    pub wildcard: &'static str,
    pub targets: &'static [&'static str],
}

#[derive(Debug, Serialize)]
pub struct CapabilityTable {
    pub upstream: &'static str,
    pub rules: &'static [CapabilityRule],
    pub broadcast: Option<Broadcast>,
}

impl CapabilityTable {
    pub fn rule(&self, domain: &str, operation: &str) -> Option<&CapabilityRule> {
        self.rules
            .iter()
            .find(|r| r.domain == domain && r.operation == operation)
    }

    /// Find the rule for `domain/operation`, failing with a policy violation
    /// when it is not declared.
    pub fn operation(&self, domain: &str, operation: &str) -> Result<&CapabilityRule, ApiError> {
        self.rule(domain, operation)
            .ok_or_else(|| ApiError::OperationNotAllowed {
                operation: format!("{}/{}", domain, operation),
            })
    }

    /// Check a concrete (domain, operation, target) triple, operation first.
    pub fn authorize(&self, domain: &str, operation: &str, target: &str) -> Result<&CapabilityRule, ApiError> {
        let rule = self.operation(domain, operation)?;
        if !rule.permits(target) {
            return Err(ApiError::TargetNotAllowed {
                target: target.to_string(),
                operation: rule.key(),
            });
        }
        Ok(rule)
    }

    /// Whether `target` is this upstream's broadcast wildcard.
    pub fn is_broadcast(&self, target: &str) -> bool {
        self.broadcast.as_ref().is_some_and(|b| b.wildcard == target)
    }
}

pub static HOME_ASSISTANT: CapabilityTable = CapabilityTable {
    upstream: "home_assistant",
    rules: &[
        CapabilityRule { domain: "light", operation: "turn_on", targets: &[TargetMatch::Prefix("light.")] },
        CapabilityRule { domain: "light", operation: "turn_off", targets: &[TargetMatch::Prefix("light.")] },
        CapabilityRule {
            domain: "media_player",
            operation: "turn_on",
            targets: &[TargetMatch::Prefix("media_player.")],
        },
        CapabilityRule {
            domain: "media_player",
            operation: "turn_off",
            targets: &[TargetMatch::Prefix("media_player.")],
        },
        CapabilityRule { domain: "remote", operation: "turn_on", targets: &[TargetMatch::Prefix("remote.")] },
        CapabilityRule { domain: "remote", operation: "turn_off", targets: &[TargetMatch::Prefix("remote.")] },
    ],
    broadcast: None,
};

/// Immich job queues that may be started from the portal.
pub const IMMICH_JOBS: &[&str] = &[
    "thumbnailGeneration",
    "metadataExtraction",
    "videoConversion",
    "smartSearch",
    "faceDetection",
    "facialRecognition",
    "duplicateDetection",
    "sidecar",
    "library",
    "storageTemplateMigration",
    "migration",
    "backgroundTask",
    "search",
    "notifications",
    "backupDatabase",
    "ocr",
    "workflow",
    "editor",
];

pub static IMMICH: CapabilityTable = CapabilityTable {
    upstream: "immich",
    rules: &[
        CapabilityRule { domain: "jobs", operation: "start", targets: &[TargetMatch::OneOf(IMMICH_JOBS)] },
        CapabilityRule { domain: "jobs", operation: "pause", targets: &[] },
        CapabilityRule { domain: "jobs", operation: "resume", targets: &[] },
        CapabilityRule { domain: "jobs", operation: "empty", targets: &[] },
    ],
    broadcast: Some(Broadcast { wildcard: "__all__", targets: IMMICH_JOBS }),
};

/// Every upstream's table, for review and listing.
pub static REGISTRY: &[&CapabilityTable] = &[&HOME_ASSISTANT, &IMMICH];

pub fn lookup(upstream: &str) -> Option<&'static CapabilityTable> {
    REGISTRY.iter().copied().find(|t| t.upstream == upstream)
}
