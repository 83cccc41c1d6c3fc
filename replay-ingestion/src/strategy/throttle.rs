use std::time::{Duration, Instant};

/// Wall-clock limiter for offset commits.
#[derive(Debug, Clone)]
pub struct CommitThrottle {
    interval: Duration,
    last_commit: Option<Instant>,
}

impl CommitThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_commit: None,
        }
    }

    pub fn should_commit(&self) -> bool {
        match self.last_commit {
            None => true,
            Some(at) => at.elapsed() >= self.interval,
        }
    }

    pub fn mark(&mut self) {
        self.last_commit = Some(Instant::now());
    }
}
