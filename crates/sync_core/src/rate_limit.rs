use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("outbound rate limit reached; retry in {retry_after:?}")]
pub struct RateLimited {
    pub retry_after: Duration,
}

/// At most `max_requests` accepted emissions within any span of `window`.
#[derive(Debug, Clone)]
pub struct OutboundRateLimiter {
    max_requests: u32,
    window: Duration,
    accepted: VecDeque<Instant>,
}

impl OutboundRateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            accepted: VecDeque::new(),
        }
    }

    pub fn try_acquire(&mut self) -> Result<(), RateLimited> {
        self.try_acquire_at(Instant::now())
    }

    pub fn try_acquire_at(&mut self, now: Instant) -> Result<(), RateLimited> {
        while let Some(oldest) = self.accepted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                self.accepted.pop_front();
            } else {
                break;
            }
        }

        if self.accepted.len() < self.max_requests as usize {
            self.accepted.push_back(now);
            return Ok(());
        }

        let retry_after = self
            .accepted
            .front()
            .map(|oldest| {
                self.window
                    .saturating_sub(now.saturating_duration_since(*oldest))
            })
            .unwrap_or_default();
        warn!(
            max_requests = self.max_requests,
            retry_after_ms = retry_after.as_millis() as u64,
            "rate_limit: rejecting outbound request"
        );
        Err(RateLimited { retry_after })
    }

    pub fn make_request<T>(&mut self, action: impl FnOnce() -> T) -> Result<T, RateLimited> {
        self.try_acquire()?;
        Ok(action())
    }

    pub fn remaining(&self) -> u32 {
        self.remaining_at(Instant::now())
    }

    pub fn remaining_at(&self, now: Instant) -> u32 {
        let in_window = self
            .accepted
            .iter()
            .filter(|at| now.saturating_duration_since(**at) < self.window)
            .count() as u32;
        self.max_requests.saturating_sub(in_window)
    }

    pub fn reset(&mut self) {
        self.accepted.clear();
    }
}
