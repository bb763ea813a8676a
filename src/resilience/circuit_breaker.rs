use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { consecutive_failures: u32 },
    /// A probe call is currently in flight. Any other caller observing this
    /// state is rejected immediately, same as `Open`.
    HalfOpen,
    Open { opened_at: Instant },
}

enum Admission {
    Proceed,
    Probe,
    Reject,
}

/// A named, process-local breaker. Three independent
/// instances are held by `ApplicationContext`, one per external dependency,
/// each with its own `fail_max`/`reset_timeout` tuning.
pub struct CircuitBreaker {
    name: String,
    fail_max: u32,
    reset_timeout: Duration,
    state: Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        fail_max: u32,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            fail_max,
            reset_timeout,
            state: Mutex::new(State::Closed { consecutive_failures: 0 }),
        }
    }

    fn admit(&self) -> Admission {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        match *state {
            State::Closed { .. } => Admission::Proceed,
            State::HalfOpen => Admission::Reject,
            State::Open { opened_at } => {
                if opened_at.elapsed() >= self.reset_timeout {
                    *state = State::HalfOpen;
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        *state = State::Closed { consecutive_failures: 0 };
    }

    fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        *state = match *state {
            State::Closed { consecutive_failures } => {
                let failures = consecutive_failures + 1;
                if failures >= self.fail_max {
                    State::Open { opened_at: Instant::now() }
                } else {
                    State::Closed { consecutive_failures: failures }
                }
            }
            State::HalfOpen | State::Open { .. } => State::Open { opened_at: Instant::now() },
        };
    }

    /// Runs `f` under this breaker. Returns `CoreError::CircuitOpen`
    /// immediately, without invoking `f`, when the breaker is open or a
    /// probe is already in flight.
    pub async fn call<F, Fut, T>(
        &self,
        f: F,
    ) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        match self.admit() {
            Admission::Reject => Err(CoreError::CircuitOpen(self.name.clone())),
            Admission::Proceed | Admission::Probe => match f().await {
                Ok(v) => {
                    self.record_success();
                    Ok(v)
                }
                Err(e) => {
                    self.record_failure();
                    Err(e)
                }
            },
        }
    }

    #[cfg(test)]
    pub fn is_open(&self) -> bool {
        matches!(*self.state.lock().unwrap(), State::Open { .. })
    }
}
