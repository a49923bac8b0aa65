//! Retry decisions for failed solver attempts.
//!
//! The default policy retries every non-zero exit forever. The solver and its
//! GPU drivers fail intermittently and a later attempt usually succeeds, so the
//! loop is only broken by an out-of-memory signature, by cancellation, or by a
//! cap the integrator opts into.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::parser::is_out_of_memory;

/// Upper bound on attempts. `None` means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Retry without limit.
    pub fn unbounded() -> Self {
        Self { max_attempts: None }
    }

    /// Give up once `max_attempts` attempts have failed (minimum one).
    pub fn capped(max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    /// Whether another attempt is allowed after `attempts` have run.
    pub fn allows_another(&self, attempts: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempts < max,
            None => true,
        }
    }
}

/// What the engine should do after an attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Exit code 0.
    Succeeded,
    /// Transient failure, start another attempt.
    Retry,
    /// Out-of-memory signature seen. Abort the work unit.
    FatalOutOfMemory { message: String },
    /// The policy cap was reached.
    Exhausted { attempts: u32 },
}

/// Attempt bookkeeping plus the retry decision for one work unit.
#[derive(Debug, Clone, Default)]
pub struct RetryHandler {
    policy: RetryPolicy,
    attempts: u32,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Whether a failed attempt should be retried.
    ///
    /// Any non-zero (or missing, i.e. killed) exit code is retried unless the
    /// detected errors contain an out-of-memory signature or the policy cap is
    /// reached.
    pub fn should_retry(&self, exit_code: Option<i32>, detected_errors: &[String]) -> bool {
        matches!(self.decide(exit_code, detected_errors), RetryDecision::Retry)
    }

    /// Full decision for an attempt that ended with `exit_code`.
    pub fn decide(&self, exit_code: Option<i32>, detected_errors: &[String]) -> RetryDecision {
        if exit_code == Some(0) {
            return RetryDecision::Succeeded;
        }
        if let Some(message) = detected_errors.iter().find(|e| is_out_of_memory(e)) {
            return RetryDecision::FatalOutOfMemory {
                message: message.clone(),
            };
        }
        if !self.policy.allows_another(self.attempts) {
            return RetryDecision::Exhausted {
                attempts: self.attempts,
            };
        }
        RetryDecision::Retry
    }

    /// Count a started attempt. Bookkeeping only; returns the new number.
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        debug!(attempt = self.attempts, "recorded solver attempt");
        self.attempts
    }

    /// Number of the current (latest started) attempt.
    pub fn attempt_number(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_is_not_retried() {
        let handler = RetryHandler::new(RetryPolicy::unbounded());
        assert!(!handler.should_retry(Some(0), &[]));
        assert_eq!(handler.decide(Some(0), &[]), RetryDecision::Succeeded);
    }

    #[test]
    fn test_unbounded_retries_thousand_failures() {
        let mut handler = RetryHandler::default();
        let errors = vec!["ERROR: CUDA driver reset".to_string()];
        for _ in 0..1000 {
            handler.record_attempt();
            assert!(handler.should_retry(Some(1), &errors));
        }
        assert_eq!(handler.attempt_number(), 1000);
    }

    #[test]
    fn test_out_of_memory_is_never_retried() {
        let mut handler = RetryHandler::default();
        for _ in 0..10 {
            handler.record_attempt();
            assert!(handler.should_retry(Some(1), &[]));
        }
        let errors = vec![
            "ERROR: kernel launch failed".to_string(),
            "FATAL: out of memory on device 0".to_string(),
        ];
        assert!(!handler.should_retry(Some(1), &errors));
        assert!(matches!(
            handler.decide(Some(1), &errors),
            RetryDecision::FatalOutOfMemory { .. }
        ));
    }

    #[test]
    fn test_killed_process_is_retried() {
        let handler = RetryHandler::default();
        assert!(handler.should_retry(None, &[]));
    }

    #[test]
    fn test_capped_policy_exhausts() {
        let mut handler = RetryHandler::new(RetryPolicy::capped(3));
        for _ in 0..2 {
            handler.record_attempt();
            assert!(handler.should_retry(Some(2), &[]));
        }
        handler.record_attempt();
        assert_eq!(
            handler.decide(Some(2), &[]),
            RetryDecision::Exhausted { attempts: 3 }
        );
    }

    #[test]
    fn test_capped_policy_minimum_is_one() {
        assert_eq!(RetryPolicy::capped(0).max_attempts, Some(1));
    }

    #[test]
    fn test_record_attempt_has_no_control_flow_effect() {
        let mut handler = RetryHandler::default();
        let before = handler.decide(Some(1), &[]);
        handler.record_attempt();
        assert_eq!(before, handler.decide(Some(1), &[]));
    }
}
