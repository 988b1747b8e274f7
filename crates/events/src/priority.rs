//! Priority bands and their numeric weights.

use serde::{Deserialize, Serialize};

/// Dispatch priority band.
///
/// Influences fetch ordering (higher first) and whether publish attempts an
/// immediate dispatch. It is not an SLA.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Numeric rank used for storage ordering (`ORDER BY priority DESC`).
    pub fn rank(self) -> i16 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }

    pub fn from_rank(rank: i16) -> Option<Self> {
        match rank {
            0 => Some(Priority::Low),
            1 => Some(Priority::Medium),
            2 => Some(Priority::High),
            3 => Some(Priority::Critical),
            _ => None,
        }
    }

    /// High and critical events get an immediate dispatch attempt at publish time.
    pub fn is_urgent(self) -> bool {
        matches!(self, Priority::High | Priority::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_rank() {
        let mut all = vec![Priority::Critical, Priority::Low, Priority::High, Priority::Medium];
        all.sort();
        assert_eq!(
            all,
            vec![Priority::Low, Priority::Medium, Priority::High, Priority::Critical]
        );
        for p in all {
            assert_eq!(Priority::from_rank(p.rank()), Some(p));
        }
        assert_eq!(Priority::from_rank(9), None);
    }

    #[test]
    fn only_high_and_critical_are_urgent() {
        assert!(!Priority::Low.is_urgent());
        assert!(!Priority::default().is_urgent());
        assert!(Priority::High.is_urgent());
        assert!(Priority::Critical.is_urgent());
    }
}
