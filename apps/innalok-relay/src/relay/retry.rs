use std::time::Duration;

/// State handed to a [`RetryPolicy`] after a connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// Reconnect attempts already made since the connection was lost.
    pub attempt: u32,
    /// Time spent reconnecting so far.
    pub elapsed: Duration,
}

pub trait RetryPolicy: Send + Sync {
    /// Delay before the next attempt, or `None` to give up.
    fn next_delay(&self, context: RetryContext) -> Option<Duration>;
}

/// Fixed list of delays, one per attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelaySchedule {
    delays: Vec<Duration>,
}

impl DelaySchedule {
    pub fn new(delays: impl Into<Vec<Duration>>) -> Self {
        Self {
            delays: delays.into(),
        }
    }

    pub fn never() -> Self {
        Self { delays: Vec::new() }
    }
}

impl Default for DelaySchedule {
    /// 0, 2, 10 and 30 seconds, then stop.
    fn default() -> Self {
        Self::new(
            [0, 2, 10, 30]
                .into_iter()
                .map(Duration::from_secs)
                .collect::<Vec<_>>(),
        )
    }
}

impl RetryPolicy for DelaySchedule {
    fn next_delay(&self, context: RetryContext) -> Option<Duration> {
        self.delays.get(context.attempt as usize).copied()
    }
}

/// Doubling delays from `initial`, capped at `max_delay`. Gives up after
/// `max_attempts` or once `max_elapsed` has been spent reconnecting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    pub initial: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
    pub max_elapsed: Option<Duration>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            max_attempts: Some(5),
            max_elapsed: None,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn next_delay(&self, context: RetryContext) -> Option<Duration> {
        if self
            .max_attempts
            .is_some_and(|max| context.attempt >= max)
        {
            return None;
        }
        if self
            .max_elapsed
            .is_some_and(|max| context.elapsed >= max)
        {
            return None;
        }
        let factor = 2u32.saturating_pow(context.attempt.min(31));
        Some(self.initial.saturating_mul(factor).min(self.max_delay))
    }
}
