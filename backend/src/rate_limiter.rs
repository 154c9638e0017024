use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep, sleep_until, Instant};

use crate::config::Settings;
use crate::errors::ProviderFailure;

const WINDOW: Duration = Duration::from_secs(60);

/// Shared call budget: at most `calls_per_window` calls per sliding window
/// and at least `cooldown` between two calls.
///
/// Callers are admitted in arrival order. The state lock is tokio's fair
/// mutex and is held while a caller waits for its slot, so later callers
/// queue behind it instead of racing for the next free slot.
pub struct RateLimiter {
    name: &'static str,
    calls_per_window: usize,
    window: Duration,
    cooldown: Duration,
    max_wait: Duration,
    state: Mutex<WindowState>,
}

#[derive(Default)]
struct WindowState {
    calls: VecDeque<Instant>,
    last_call: Option<Instant>,
}

impl WindowState {
    fn evict(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.calls.front() {
            if now.duration_since(oldest) >= window {
                self.calls.pop_front();
            } else {
                break;
            }
        }
    }
}

impl RateLimiter {
    pub fn new(name: &'static str, calls_per_window: usize, cooldown: Duration, max_wait: Duration) -> Self {
        log::info!(
            "Rate limiter '{}' initialized: {} calls/minute, {:?} cooldown",
            name,
            calls_per_window,
            cooldown
        );
        Self {
            name,
            calls_per_window: calls_per_window.max(1),
            window: WINDOW,
            cooldown,
            max_wait,
            state: Mutex::new(WindowState::default()),
        }
    }

    pub fn from_settings(name: &'static str, settings: &Settings) -> Self {
        Self::new(
            name,
            settings.rate_limit_calls,
            settings.rate_limit_cooldown,
            settings.rate_limit_max_wait,
        )
    }

    /// Wait for a slot and record the call. Returns how long the caller
    /// waited, or `RateLimited` if the slot lies beyond the maximum wait.
    pub async fn acquire(&self) -> Result<Duration, ProviderFailure> {
        let queued_at = Instant::now();
        let mut state = self.state.lock().await;

        loop {
            let now = Instant::now();
            state.evict(now, self.window);

            let mut ready_at = now;
            if let Some(last) = state.last_call {
                ready_at = ready_at.max(last + self.cooldown);
            }
            if state.calls.len() >= self.calls_per_window {
                if let Some(&oldest) = state.calls.front() {
                    ready_at = ready_at.max(oldest + self.window);
                }
            }

            if ready_at <= now {
                state.calls.push_back(now);
                state.last_call = Some(now);
                let waited = now.duration_since(queued_at);
                if waited > Duration::from_millis(100) {
                    log::info!("Rate limiter '{}' waited {:.2}s", self.name, waited.as_secs_f64());
                }
                return Ok(waited);
            }

            if ready_at.duration_since(queued_at) > self.max_wait {
                log::warn!(
                    "Rate limiter '{}' budget exhausted: next slot in {:.2}s exceeds max wait {:.2}s",
                    self.name,
                    ready_at.duration_since(now).as_secs_f64(),
                    self.max_wait.as_secs_f64()
                );
                return Err(ProviderFailure::RateLimited(format!(
                    "{} budget exhausted; try again later",
                    self.name
                )));
            }

            sleep_until(ready_at).await;
        }
    }
}

/// Run `op` up to `max_attempts` times, sleeping `base_delay * 2^n` between
/// attempts. Fatal failures are returned at once.
pub async fn with_retry<T, F, Fut>(
    label: &str,
    max_attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, ProviderFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderFailure>>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => {
                log::error!("{} failed permanently: {}", label, e);
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                log::error!("{} failed after {} attempts: {}", label, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                log::warn!(
                    "{} attempt {}/{} failed: {}. Retrying in {:?}",
                    label,
                    attempt,
                    max_attempts,
                    e,
                    delay
                );
                sleep(delay).await;
            }
        }
    }
}
