//! Agent kinds and their oracle-stage mapping.
//!
//! The four task agents observed by the meta-learner form a small closed
//! set. Policies that vary by kind (stage keys, file prefixes) live here as
//! tables on the enum rather than behind trait objects.

use serde::{Deserialize, Serialize};

/// The task-agent roles whose executions the meta-learner observes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Diagnosis,
    Localization,
    Mitigation,
    Rollback,
}

impl AgentKind {
    /// All kinds, in pipeline order.
    pub const ALL: [AgentKind; 4] = [
        AgentKind::Diagnosis,
        AgentKind::Localization,
        AgentKind::Mitigation,
        AgentKind::Rollback,
    ];

    /// Lowercase identifier used in file names and serialized records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Diagnosis => "diagnosis",
            Self::Localization => "localization",
            Self::Mitigation => "mitigation",
            Self::Rollback => "rollback",
        }
    }

    /// Oracle stage key this kind is judged under.
    ///
    /// Rollback has no oracle of its own and is judged by the Mitigation
    /// stage verdict.
    pub fn stage_key(&self) -> &'static str {
        match self {
            Self::Diagnosis => "Detection",
            Self::Localization => "Localization",
            Self::Mitigation | Self::Rollback => "Mitigation",
        }
    }

    /// Parse a lowercase identifier back into a kind.
    pub fn parse(s: &str) -> Option<AgentKind> {
        match s {
            "diagnosis" => Some(Self::Diagnosis),
            "localization" => Some(Self::Localization),
            "mitigation" => Some(Self::Mitigation),
            "rollback" => Some(Self::Rollback),
            _ => None,
        }
    }

    /// One-line description of the agent's role, used in optimizer prompts.
    pub fn role_description(&self) -> &'static str {
        match self {
            Self::Diagnosis => "diagnosing faults in microservices applications",
            Self::Localization => "localizing faults to specific components and services",
            Self::Mitigation => "mitigating and fixing identified faults",
            Self::Rollback => "rolling back changes when mitigation fails",
        }
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_keys() {
        assert_eq!(AgentKind::Diagnosis.stage_key(), "Detection");
        assert_eq!(AgentKind::Localization.stage_key(), "Localization");
        assert_eq!(AgentKind::Mitigation.stage_key(), "Mitigation");
        assert_eq!(AgentKind::Rollback.stage_key(), "Mitigation");
    }

    #[test]
    fn test_parse_roundtrip() {
        for kind in AgentKind::ALL {
            assert_eq!(AgentKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AgentKind::parse("unknown"), None);
    }

    #[test]
    fn test_serde_rename() {
        let json = serde_json::to_string(&AgentKind::Diagnosis).unwrap();
        assert_eq!(json, "\"diagnosis\"");
        let back: AgentKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, AgentKind::Diagnosis);
    }
}
