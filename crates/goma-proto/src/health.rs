//! The health-status string of spec §6.

use std::fmt;

/// One of the four shapes spec §6 defines for the health-status string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Initializing,
    Ok,
    ShuttingDown,
    /// `<running|error>: <reason>` — `fail_fast` selects which word is used.
    Degraded { fail_fast: bool, reason: String },
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Initializing => write!(f, "initializing"),
            HealthStatus::Ok => write!(f, "ok"),
            HealthStatus::ShuttingDown => write!(f, "shutting down"),
            HealthStatus::Degraded { fail_fast, reason } => {
                let word = if *fail_fast { "error" } else { "running" };
                write!(f, "{word}: {reason}")
            }
        }
    }
}

impl HealthStatus {
    /// The specific 401/403 health message the concrete scenario in spec §8
    /// names verbatim.
    pub fn access_rejected(fail_fast: bool) -> Self {
        HealthStatus::Degraded {
            fail_fast,
            reason: "access to backend servers was rejected.".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_renders_as_ok() {
        assert_eq!(HealthStatus::Ok.to_string(), "ok");
    }

    #[test]
    fn access_rejected_matches_spec_scenario_2() {
        // Scenario 2 pings with the default (fail-fast) client.
        let status = HealthStatus::access_rejected(true);
        assert_eq!(
            status.to_string(),
            "error: access to backend servers was rejected."
        );
    }

    #[test]
    fn degraded_uses_running_when_not_fail_fast() {
        let status = HealthStatus::Degraded {
            fail_fast: false,
            reason: "connect timed out".to_string(),
        };
        assert_eq!(status.to_string(), "running: connect timed out");
    }
}
