//! 单个动作调用的状态机
//!
//! RECEIVED -> RESOLVED -> PARSED -> {ADMITTED | CACHED | BLOCKED | CONFIRM_REQUIRED}
//! -> (ADMITTED) QUEUED -> RUNNING -> {SUCCEEDED | FAILED} -> RESULT_EMITTED。
//! 解析 / 参数解析失败直接进入 FAILED；排队期间被取消也进入 FAILED。
//! 非法迁移属于编程错误：记 error 日志并忽略。

use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallPhase {
    Received,
    Resolved,
    Parsed,
    Admitted,
    Cached,
    Blocked,
    ConfirmRequired,
    Queued,
    Running,
    Succeeded,
    Failed,
    ResultEmitted,
}

impl CallPhase {
    /// 终态之后只剩 RESULT_EMITTED
    pub fn is_outcome(self) -> bool {
        matches!(
            self,
            CallPhase::Cached
                | CallPhase::Blocked
                | CallPhase::ConfirmRequired
                | CallPhase::Succeeded
                | CallPhase::Failed
        )
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: CallPhase,
    pub to: CallPhase,
}

pub fn validate_transition(from: CallPhase, to: CallPhase) -> Result<(), InvalidTransition> {
    use CallPhase::*;

    let valid = matches!(
        (from, to),
        (Received, Resolved)
            | (Received, Failed)
            | (Resolved, Parsed)
            | (Resolved, Failed)
            | (Parsed, Admitted)
            | (Parsed, Cached)
            | (Parsed, Blocked)
            | (Parsed, ConfirmRequired)
            | (Admitted, Queued)
            | (Queued, Running)
            | (Queued, Failed)
            | (Running, Succeeded)
            | (Running, Failed)
    ) || (from.is_outcome() && to == ResultEmitted);

    if valid {
        Ok(())
    } else {
        Err(InvalidTransition { from, to })
    }
}

/// 记录一次调用走过的阶段；可在 lane 内外共享
#[derive(Debug)]
pub struct CallTracker {
    call_id: String,
    history: Mutex<Vec<CallPhase>>,
}

impl CallTracker {
    pub fn new(call_id: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            history: Mutex::new(vec![CallPhase::Received]),
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.history
            .lock()
            .last()
            .copied()
            .unwrap_or(CallPhase::Received)
    }

    /// 迁移到下一阶段；非法迁移不生效，返回 false
    pub fn advance(&self, to: CallPhase) -> bool {
        let mut history = self.history.lock();
        let from = history.last().copied().unwrap_or(CallPhase::Received);
        match validate_transition(from, to) {
            Ok(()) => {
                history.push(to);
                true
            }
            Err(e) => {
                tracing::error!(
                    call_id = %self.call_id,
                    from = %e.from,
                    to = %e.to,
                    "Invalid call state transition ignored"
                );
                false
            }
        }
    }

    pub fn history(&self) -> Vec<CallPhase> {
        self.history.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::CallPhase::*;
    use super::*;

    #[test]
    fn test_happy_path() {
        let tracker = CallTracker::new("c1");
        for phase in [Resolved, Parsed, Admitted, Queued, Running, Succeeded, ResultEmitted] {
            assert!(tracker.advance(phase), "{phase}");
        }
        assert_eq!(tracker.phase(), ResultEmitted);
    }

    #[test]
    fn test_rejection_branches_are_terminal() {
        for outcome in [Cached, Blocked, ConfirmRequired] {
            assert!(validate_transition(Parsed, outcome).is_ok());
            assert!(validate_transition(outcome, ResultEmitted).is_ok());
            assert!(validate_transition(outcome, Queued).is_err());
        }
    }

    #[test]
    fn test_early_failures_go_to_failed() {
        assert!(validate_transition(Received, Failed).is_ok());
        assert!(validate_transition(Resolved, Failed).is_ok());
        assert!(validate_transition(Queued, Failed).is_ok());
    }

    #[test]
    fn test_invalid_transition_is_ignored() {
        let tracker = CallTracker::new("c2");
        assert!(!tracker.advance(Running));
        assert_eq!(tracker.phase(), Received);
        assert!(!tracker.advance(ResultEmitted));
        assert_eq!(tracker.history(), vec![Received]);
    }

    #[test]
    fn test_result_emitted_is_final() {
        assert!(validate_transition(ResultEmitted, Received).is_err());
        assert!(validate_transition(Succeeded, Failed).is_err());
    }
}
