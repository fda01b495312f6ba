//! Failure detection for group members.
//!
//! The tracker only does bookkeeping; the supervisor task in `group` samples
//! statuses and acts on the verdicts. Each uninterrupted unhealthy period
//! yields at most one [`Verdict::Remediate`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::models::HeartbeatStatus;

/// What the supervisor does with a member unhealthy for too long.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LivenessPolicy {
    /// Ask the bootstrap capability to bring the agent back.
    #[default]
    Restart,
    /// Fail the whole group.
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Alive,
    Waiting { unhealthy_for: Duration },
    Remediate { unhealthy_for: Duration },
    AlreadyRemediated { unhealthy_for: Duration },
}

#[derive(Debug)]
struct Period {
    last_healthy: Instant,
    remediated: bool,
}

#[derive(Debug)]
pub struct LivenessTracker {
    member_timeout: Duration,
    members: HashMap<String, Period>,
}

impl LivenessTracker {
    pub fn new(member_timeout: Duration) -> Self {
        Self {
            member_timeout,
            members: HashMap::new(),
        }
    }

    /// Record one status sample. A member seen for the first time starts its
    /// clock at `now`, whatever its status.
    pub fn observe(&mut self, member: &str, status: HeartbeatStatus, now: Instant) -> Verdict {
        let period = self.members.entry(member.to_string()).or_insert(Period {
            last_healthy: now,
            remediated: false,
        });

        if status == HeartbeatStatus::Healthy {
            period.last_healthy = now;
            period.remediated = false;
            return Verdict::Alive;
        }

        let unhealthy_for = now.saturating_duration_since(period.last_healthy);
        if unhealthy_for <= self.member_timeout {
            Verdict::Waiting { unhealthy_for }
        } else if period.remediated {
            Verdict::AlreadyRemediated { unhealthy_for }
        } else {
            period.remediated = true;
            Verdict::Remediate { unhealthy_for }
        }
    }

    pub fn last_healthy(&self, member: &str) -> Option<Instant> {
        self.members.get(member).map(|period| period.last_healthy)
    }

    /// Drop bookkeeping of members no longer in the group.
    pub fn retain<F>(&mut self, mut keep: F)
    where
        F: FnMut(&str) -> bool,
    {
        self.members.retain(|name, _| keep(name));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use HeartbeatStatus::*;

    const TIMEOUT: Duration = Duration::from_secs(10);

    #[test]
    fn test_one_remediation_per_outage() {
        let mut tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        let at = |secs| t0 + Duration::from_secs(secs);

        assert_eq!(tracker.observe("node1", Healthy, at(0)), Verdict::Alive);
        assert!(matches!(tracker.observe("node1", Unhealthy, at(5)), Verdict::Waiting { .. }));
        assert!(matches!(tracker.observe("node1", Unhealthy, at(11)), Verdict::Remediate { .. }));
        assert!(matches!(tracker.observe("node1", Unhealthy, at(20)), Verdict::AlreadyRemediated { .. }));
        assert!(matches!(tracker.observe("node1", Unknown, at(40)), Verdict::AlreadyRemediated { .. }));

        // recovery opens a new period
        assert_eq!(tracker.observe("node1", Healthy, at(41)), Verdict::Alive);
        assert!(matches!(tracker.observe("node1", Unhealthy, at(45)), Verdict::Waiting { .. }));
        assert_eq!(
            tracker.observe("node1", Unhealthy, at(52)),
            Verdict::Remediate {
                unhealthy_for: Duration::from_secs(11)
            }
        );
    }

    #[test]
    fn test_first_sight_starts_the_clock() {
        let mut tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();

        assert!(matches!(tracker.observe("node2", Unknown, t0), Verdict::Waiting { .. }));
        assert_eq!(tracker.last_healthy("node2"), Some(t0));
        assert!(matches!(
            tracker.observe("node2", Unknown, t0 + Duration::from_secs(11)),
            Verdict::Remediate { .. }
        ));
    }

    #[test]
    fn test_members_are_independent() {
        let mut tracker = LivenessTracker::new(TIMEOUT);
        let t0 = Instant::now();
        tracker.observe("a", Unhealthy, t0);
        tracker.observe("b", Healthy, t0);

        let later = t0 + Duration::from_secs(15);
        assert!(matches!(tracker.observe("a", Unhealthy, later), Verdict::Remediate { .. }));
        assert_eq!(tracker.observe("b", Healthy, later), Verdict::Alive);

        tracker.retain(|name| name == "b");
        assert_eq!(tracker.last_healthy("a"), None);
    }

    #[test]
    fn test_policy_from_yaml() {
        let policy: LivenessPolicy = serde_yaml::from_str("strict").unwrap();
        assert_eq!(policy, LivenessPolicy::Strict);
        assert_eq!(LivenessPolicy::default(), LivenessPolicy::Restart);
    }
}
