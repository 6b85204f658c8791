use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Portal roles tracked by presence. Operators are the organization admins, members the students.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceRole {
    Operator,
    Member,
}

impl PresenceRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            PresenceRole::Operator => "operator",
            PresenceRole::Member => "member",
        }
    }

    pub fn counterpart(&self) -> Self {
        match self {
            PresenceRole::Operator => PresenceRole::Member,
            PresenceRole::Member => PresenceRole::Operator,
        }
    }
}

impl fmt::Display for PresenceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PresenceRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "operator" | "admin" => Ok(PresenceRole::Operator),
            "member" | "student" => Ok(PresenceRole::Member),
            other => Err(format!("Unknown presence role: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppLifecycleState {
    Active,
    Inactive,
    Background,
}

impl AppLifecycleState {
    pub fn is_foreground(&self) -> bool {
        matches!(self, AppLifecycleState::Active)
    }
}
