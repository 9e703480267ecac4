use std::time::{Duration, Instant};

/// Audio-device health. Playback failures walk the machine away from
/// `Healthy`; any successful playback snaps it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioHealth {
    Healthy,
    Degraded,
    Recovering(u32),
    Down,
}

impl AudioHealth {
    pub fn is_healthy(self) -> bool {
        self == Self::Healthy
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Recovering(_) => "recovering",
            Self::Down => "down",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub cooldown: Duration,
    /// Escalating recovery argv list: attempt n runs `commands[n-1]`,
    /// clamped to the last entry (suspend/resume sinks, kill stray players,
    /// restart the daemon).
    pub commands: Vec<Vec<String>>,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            cooldown: Duration::from_secs(30),
            commands: Vec::new(),
        }
    }
}

impl RecoveryPolicy {
    /// Exponential backoff before recovery attempt n.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(5);
        self.cooldown.saturating_mul(1 << exponent)
    }

    pub fn command_for(&self, attempt: u32) -> Option<&[String]> {
        if self.commands.is_empty() {
            return None;
        }
        let index = (attempt.saturating_sub(1) as usize).min(self.commands.len() - 1);
        Some(&self.commands[index])
    }
}

/// What a failure transition asks the engine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureDirective {
    pub emit_pulse_down: bool,
    pub attempt: Option<u32>,
}

#[derive(Debug)]
pub(crate) struct RecoveryTracker {
    policy: RecoveryPolicy,
    health: AudioHealth,
    last_failure_at: Option<Instant>,
    pulse_down_emitted: bool,
}

impl RecoveryTracker {
    pub(crate) fn new(policy: RecoveryPolicy) -> Self {
        Self {
            policy,
            health: AudioHealth::Healthy,
            last_failure_at: None,
            pulse_down_emitted: false,
        }
    }

    pub(crate) fn health(&self) -> AudioHealth {
        self.health
    }

    pub(crate) fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    pub(crate) fn record_failure(&mut self, now: Instant) -> FailureDirective {
        self.last_failure_at = Some(now);
        let emit_pulse_down = !std::mem::replace(&mut self.pulse_down_emitted, true);
        let attempt = match self.health {
            AudioHealth::Healthy => {
                self.health = AudioHealth::Degraded;
                None
            }
            AudioHealth::Degraded => {
                self.health = AudioHealth::Recovering(1);
                Some(1)
            }
            AudioHealth::Recovering(n) if n < self.policy.max_attempts => {
                self.health = AudioHealth::Recovering(n + 1);
                Some(n + 1)
            }
            AudioHealth::Recovering(_) => {
                self.health = AudioHealth::Down;
                None
            }
            AudioHealth::Down => None,
        };
        FailureDirective {
            emit_pulse_down,
            attempt,
        }
    }

    /// Returns true when a `pulse_recovered` event should be emitted.
    pub(crate) fn record_success(&mut self) -> bool {
        self.health = AudioHealth::Healthy;
        self.last_failure_at = None;
        std::mem::take(&mut self.pulse_down_emitted)
    }

    /// Quiet-period reset: five cooldowns without a new failure clears the
    /// streak. Returns true when a `pulse_recovered` event should be emitted.
    pub(crate) fn maybe_reset(&mut self, now: Instant) -> bool {
        if self.health.is_healthy() {
            return false;
        }
        let quiet_enough = self
            .last_failure_at
            .map(|last| now.duration_since(last) >= self.policy.cooldown * 5)
            .unwrap_or(true);
        if !quiet_enough {
            return false;
        }
        self.record_success()
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::{AudioHealth, RecoveryPolicy, RecoveryTracker};

    fn tracker() -> RecoveryTracker {
        RecoveryTracker::new(RecoveryPolicy {
            max_attempts: 3,
            cooldown: Duration::from_millis(10),
            commands: vec![
                vec!["suspend-resume".to_owned()],
                vec!["kill-strays".to_owned()],
                vec!["restart-daemon".to_owned()],
            ],
        })
    }

    #[test]
    fn three_failures_walk_healthy_to_recovering_with_one_pulse_down() {
        let mut tracker = tracker();
        let now = Instant::now();

        let first = tracker.record_failure(now);
        assert!(first.emit_pulse_down);
        assert_eq!(tracker.health(), AudioHealth::Degraded);

        let second = tracker.record_failure(now);
        assert!(!second.emit_pulse_down);
        assert_eq!(second.attempt, Some(1));
        assert_eq!(tracker.health(), AudioHealth::Recovering(1));

        let third = tracker.record_failure(now);
        assert!(!third.emit_pulse_down);
        assert_eq!(third.attempt, Some(2));
        assert_eq!(tracker.health(), AudioHealth::Recovering(2));
    }

    #[test]
    fn exhausted_attempts_land_in_down() {
        let mut tracker = tracker();
        let now = Instant::now();
        for _ in 0..5 {
            tracker.record_failure(now);
        }
        assert_eq!(tracker.health(), AudioHealth::Down);
        // Further failures stay down without new directives.
        let directive = tracker.record_failure(now);
        assert_eq!(directive.attempt, None);
        assert_eq!(tracker.health(), AudioHealth::Down);
    }

    #[test]
    fn success_recovers_and_pairs_pulse_events() {
        let mut tracker = tracker();
        tracker.record_failure(Instant::now());

        assert!(tracker.record_success());
        assert_eq!(tracker.health(), AudioHealth::Healthy);
        // A second success emits nothing further.
        assert!(!tracker.record_success());
    }

    #[test]
    fn quiet_period_resets_the_streak() {
        let mut tracker = tracker();
        let start = Instant::now();
        tracker.record_failure(start);
        tracker.record_failure(start);

        assert!(!tracker.maybe_reset(start + Duration::from_millis(20)));
        assert!(tracker.maybe_reset(start + Duration::from_millis(60)));
        assert_eq!(tracker.health(), AudioHealth::Healthy);
    }

    #[test]
    fn backoff_escalates_and_commands_clamp() {
        let policy = RecoveryPolicy {
            max_attempts: 5,
            cooldown: Duration::from_secs(1),
            commands: vec![vec!["a".to_owned()], vec!["b".to_owned()]],
        };
        assert_eq!(policy.backoff_for(1), Duration::from_secs(1));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(3), Duration::from_secs(4));
        assert_eq!(policy.command_for(1).map(|c| &c[0][..]), Some("a"));
        assert_eq!(policy.command_for(4).map(|c| &c[0][..]), Some("b"));
        assert_eq!(RecoveryPolicy::default().command_for(1), None);
    }
}
