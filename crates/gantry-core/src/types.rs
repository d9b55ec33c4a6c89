//! Risk classification and identifier helpers.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CoreError;

/// Risk attached to an operation, deciding whether it must pass the
/// approval gateway before execution.
///
/// Ordering follows severity: `Low < Moderate < High < Critical`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    /// Whether an operation at this level must be gated through the
    /// approval flow. Low-risk operations never are.
    pub fn requires_gate(&self) -> bool {
        *self > RiskLevel::Low
    }
}

impl Default for RiskLevel {
    fn default() -> Self {
        RiskLevel::Low
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Moderate => write!(f, "moderate"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for RiskLevel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(RiskLevel::Low),
            "moderate" => Ok(RiskLevel::Moderate),
            "high" => Ok(RiskLevel::High),
            "critical" => Ok(RiskLevel::Critical),
            other => Err(CoreError::Validation(format!(
                "Unknown risk level: {}",
                other
            ))),
        }
    }
}

/// Short 8-character identifier used for tasks and task lists.
pub fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}
