//! Agent identities and per-agent containers.
//!
//! The client talks to exactly two agents. Everything that is tracked per
//! agent lives in a [`PerAgent`] so it can only ever be indexed by a valid id.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One of the two conversational agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentId {
    /// Primary agent (default focus)
    #[default]
    Sisi,

    /// Secondary agent
    Liuye,
}

impl AgentId {
    /// Both agents, in display order
    pub const ALL: [AgentId; 2] = [AgentId::Sisi, AgentId::Liuye];

    /// Wire identifier
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sisi => "sisi",
            Self::Liuye => "liuye",
        }
    }

    /// Human-readable name shown next to the agent's messages
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Sisi => "思思",
            Self::Liuye => "柳叶",
        }
    }

    /// Parse a loosely formatted id (`" Liuye "` is accepted)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sisi" => Some(Self::Sisi),
            "liuye" => Some(Self::Liuye),
            _ => None,
        }
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown agent: {}", s))
    }
}

/// Cognitive state an agent reports through the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    WakePending,
    Listening,
    Thinking,
    Speaking,
}

impl AgentStatus {
    /// Parse a backend status string (case-insensitive)
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(Self::Idle),
            "wake_pending" => Some(Self::WakePending),
            "listening" => Some(Self::Listening),
            "thinking" => Some(Self::Thinking),
            "speaking" => Some(Self::Speaking),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::WakePending => "wake_pending",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
        }
    }
}

/// A value held once for each agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerAgent<T> {
    pub sisi: T,
    pub liuye: T,
}

impl<T> PerAgent<T> {
    pub fn new(sisi: T, liuye: T) -> Self {
        Self { sisi, liuye }
    }

    /// Iterate `(agent, value)` pairs in display order
    pub fn iter(&self) -> impl Iterator<Item = (AgentId, &T)> {
        [(AgentId::Sisi, &self.sisi), (AgentId::Liuye, &self.liuye)].into_iter()
    }
}

impl<T> Index<AgentId> for PerAgent<T> {
    type Output = T;

    fn index(&self, agent: AgentId) -> &T {
        match agent {
            AgentId::Sisi => &self.sisi,
            AgentId::Liuye => &self.liuye,
        }
    }
}

impl<T> IndexMut<AgentId> for PerAgent<T> {
    fn index_mut(&mut self, agent: AgentId) -> &mut T {
        match agent {
            AgentId::Sisi => &mut self.sisi,
            AgentId::Liuye => &mut self.liuye,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_parse() {
        assert_eq!(AgentId::parse("sisi"), Some(AgentId::Sisi));
        assert_eq!(AgentId::parse(" LIUYE "), Some(AgentId::Liuye));
        assert_eq!(AgentId::parse("member"), None);
        assert_eq!(AgentId::parse(""), None);
    }

    #[test]
    fn test_agent_serialization() {
        let json = serde_json::to_string(&AgentId::Liuye).unwrap();
        assert_eq!(json, "\"liuye\"");
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(AgentStatus::parse("Thinking"), Some(AgentStatus::Thinking));
        assert_eq!(AgentStatus::parse("wake_pending"), Some(AgentStatus::WakePending));
        assert_eq!(AgentStatus::parse("sleeping"), None);
    }

    #[test]
    fn test_per_agent_index() {
        let mut flags: PerAgent<bool> = PerAgent::default();
        flags[AgentId::Liuye] = true;

        assert!(!flags[AgentId::Sisi]);
        assert!(flags[AgentId::Liuye]);
        assert_eq!(flags.iter().filter(|(_, v)| **v).count(), 1);
    }
}
