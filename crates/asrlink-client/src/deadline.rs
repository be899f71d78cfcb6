use asrlink_core::RecognitionError;
use std::time::Duration;
use tokio::time::Instant;

/// Wall-clock bound of a session, fixed when the session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

/// Upper bound for the instant a deadline can land on. Budgets past it are
/// treated as unbounded.
const HORIZON: Duration = Duration::from_secs(86_400 * 365 * 30);

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        let now = Instant::now();
        let at = now
            .checked_add(budget.min(HORIZON))
            .unwrap_or(now);
        Self { at, budget }
    }

    pub fn instant(&self) -> Instant {
        self.at
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.at
    }

    pub fn exceeded(&self) -> RecognitionError {
        RecognitionError::DeadlineExceeded(self.budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deadline_expires() {
        let deadline = Deadline::after(Duration::from_millis(20));
        assert!(!deadline.is_expired());
        tokio::time::sleep_until(deadline.instant()).await;
        assert!(deadline.is_expired());
        assert_eq!(
            deadline.exceeded(),
            RecognitionError::DeadlineExceeded(Duration::from_millis(20))
        );
    }

    #[tokio::test]
    async fn test_huge_budget_does_not_overflow() {
        let deadline = Deadline::after(Duration::MAX);
        assert!(!deadline.is_expired());
        assert!(deadline.instant() > Instant::now() + Duration::from_secs(86_400 * 365));
        assert_eq!(deadline.budget(), Duration::MAX);
    }
}
