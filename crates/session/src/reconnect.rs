use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use direct_protocol::{Role, SessionConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            delay: Duration::from_millis(1000),
        }
    }
}

impl From<&SessionConfig> for ReconnectPolicy {
    fn from(config: &SessionConfig) -> Self {
        Self {
            enabled: config.reconnect,
            max_attempts: config.max_reconnect_attempts,
            delay: Duration::from_millis(config.reconnect_delay_ms),
        }
    }
}

/// What to do after a transport drop has been torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Disabled,
    /// Callee: the listener is still up, wait for the next caller.
    AwaitInbound,
    Retry { attempt: u32, delay: Duration },
    Exhausted,
}

/// Disconnect bookkeeping shared by every thread that can observe a drop.
///
/// `handling_disconnect` admits a single handler at a time;
/// `is_disconnected` makes a second report of the same drop a no-op.
#[derive(Debug)]
pub struct ReconnectState {
    policy: ReconnectPolicy,
    attempts: AtomicU32,
    handling_disconnect: AtomicBool,
    is_disconnected: AtomicBool,
    disconnects_handled: AtomicU32,
}

impl ReconnectState {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: AtomicU32::new(0),
            handling_disconnect: AtomicBool::new(false),
            is_disconnected: AtomicBool::new(false),
            disconnects_handled: AtomicU32::new(0),
        }
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.policy
    }

    /// Claim the handler slot. False if another handler holds it.
    pub fn try_begin_handling(&self) -> bool {
        self.handling_disconnect
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish_handling(&self) {
        self.handling_disconnect.store(false, Ordering::Release);
    }

    /// Record the drop. False if it was already recorded.
    pub fn mark_disconnected(&self) -> bool {
        if self.is_disconnected.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.disconnects_handled.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn is_disconnected(&self) -> bool {
        self.is_disconnected.load(Ordering::Acquire)
    }

    /// A fresh transport is up (accepted or connected).
    pub fn clear_disconnected(&self) {
        self.is_disconnected.store(false, Ordering::Release);
    }

    pub fn on_reconnected(&self) {
        self.attempts.store(0, Ordering::Release);
        self.clear_disconnected();
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn disconnects_handled(&self) -> u32 {
        self.disconnects_handled.load(Ordering::Acquire)
    }

    /// Decide the next step, consuming one attempt on `Retry`.
    pub fn decide(&self, role: Role) -> ReconnectDecision {
        if !self.policy.enabled {
            return ReconnectDecision::Disabled;
        }
        if role == Role::Callee {
            return ReconnectDecision::AwaitInbound;
        }
        let claimed = self
            .attempts
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.policy.max_attempts).then_some(n + 1)
            });
        match claimed {
            Ok(previous) => ReconnectDecision::Retry {
                attempt: previous + 1,
                delay: self.policy.delay,
            },
            Err(_) => ReconnectDecision::Exhausted,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn policy(max_attempts: u32) -> ReconnectPolicy {
        ReconnectPolicy {
            enabled: true,
            max_attempts,
            delay: Duration::from_millis(10),
        }
    }

    #[test]
    fn caller_retries_up_to_the_limit() {
        let state = ReconnectState::new(policy(5));
        for attempt in 1..=5 {
            assert_eq!(
                state.decide(Role::Caller),
                ReconnectDecision::Retry {
                    attempt,
                    delay: Duration::from_millis(10)
                }
            );
        }
        assert_eq!(state.decide(Role::Caller), ReconnectDecision::Exhausted);
        assert_eq!(state.attempts(), 5);

        state.on_reconnected();
        assert_eq!(state.attempts(), 0);
        assert!(matches!(state.decide(Role::Caller), ReconnectDecision::Retry { attempt: 1, .. }));
    }

    #[test]
    fn callee_never_dials_out() {
        let state = ReconnectState::new(policy(5));
        assert_eq!(state.decide(Role::Callee), ReconnectDecision::AwaitInbound);
        assert_eq!(state.attempts(), 0);
    }

    #[test]
    fn disabled_policy_stops() {
        let state = ReconnectState::new(ReconnectPolicy {
            enabled: false,
            ..ReconnectPolicy::default()
        });
        assert_eq!(state.decide(Role::Caller), ReconnectDecision::Disabled);
    }

    #[test]
    fn second_report_of_same_drop_is_ignored() {
        let state = ReconnectState::new(policy(5));
        assert!(state.mark_disconnected());
        assert!(!state.mark_disconnected());
        assert_eq!(state.disconnects_handled(), 1);

        state.clear_disconnected();
        assert!(state.mark_disconnected());
        assert_eq!(state.disconnects_handled(), 2);
    }

    #[test]
    fn concurrent_handlers_tear_down_once() {
        let state = Arc::new(ReconnectState::new(policy(5)));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    if !state.try_begin_handling() {
                        return false;
                    }
                    let tore_down = state.mark_disconnected();
                    state.finish_handling();
                    tore_down
                })
            })
            .collect();

        let teardowns = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|t| *t)
            .count();
        assert_eq!(teardowns, 1);
        assert_eq!(state.disconnects_handled(), 1);
        assert!(state.try_begin_handling());
    }

    #[test]
    fn policy_from_config() {
        let config = SessionConfig {
            reconnect_delay_ms: 250,
            max_reconnect_attempts: 2,
            ..SessionConfig::default()
        };
        let policy = ReconnectPolicy::from(&config);
        assert_eq!(policy.delay, Duration::from_millis(250));
        assert_eq!(policy.max_attempts, 2);
        assert!(policy.enabled);
    }
}
