//! Circuit breaker guarding the Gmail API
//!
//! Tracks consecutive failures and, once a threshold is reached, rejects
//! calls for a cooldown window without touching the network. After the
//! cooldown a single probe is let through; `success_threshold` consecutive
//! probe successes close the circuit again, while any probe failure reopens
//! it immediately.
//!
//! # Circuit States
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Threshold exceeded, requests are rejected immediately
//! - **HalfOpen**: Probation, one request at a time is let through
//!
//! # Usage
//!
//! ```no_run
//! use gmail_backup::circuit_breaker::CircuitBreaker;
//! use gmail_backup::config::CircuitBreakerConfig;
//! use gmail_backup::error::GmailError;
//!
//! # async fn example() -> Result<(), GmailError> {
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
//!
//! let value = breaker
//!     .call(|| async { Ok::<_, GmailError>(42) })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{GmailError, Result};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    /// Consecutive failures
    failure_count: u32,
    /// Consecutive successes while half-open
    success_count: u32,
    opened_at: Option<Instant>,
    /// A half-open probe is in flight
    probe_in_flight: bool,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerState {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            probe_in_flight: false,
            config,
        }
    }

    fn cooldown(&self) -> Duration {
        Duration::from_secs(self.config.reset_timeout_secs)
    }

    fn rejection(&self, retry_after: Duration) -> GmailError {
        GmailError::CircuitBreakerOpen {
            message: format!(
                "Circuit breaker is open after {} consecutive failures",
                self.failure_count
            ),
            retry_after_secs: retry_after.as_secs().max(1),
        }
    }

    /// Admit or reject a request; `Ok(true)` means it is the half-open trial request
    fn should_allow_request(&mut self) -> Result<bool> {
        if !self.config.enabled {
            return Ok(false);
        }

        match self.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let Some(opened_at) = self.opened_at else {
                    warn!("Circuit breaker open without a timestamp, closing");
                    self.close();
                    return Ok(false);
                };

                let elapsed = opened_at.elapsed();
                if elapsed >= self.cooldown() {
                    debug!(
                        "Circuit breaker half-open after {:?}, letting a probe through",
                        elapsed
                    );
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    self.probe_in_flight = true;
                    Ok(true)
                } else {
                    Err(self.rejection(self.cooldown() - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(self.rejection(Duration::from_secs(1)))
                } else {
                    self.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// The trial request ended without an outcome (its future was dropped)
    fn release_trial(&mut self) {
        if self.state == CircuitState::HalfOpen && self.probe_in_flight {
            debug!("Circuit breaker: trial request dropped, admitting the next one");
            self.probe_in_flight = false;
        }
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.success_count = 0;
        self.opened_at = None;
        self.probe_in_flight = false;
    }

    fn open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.success_count = 0;
        self.probe_in_flight = false;
    }

    fn record_success(&mut self) {
        if !self.config.enabled {
            return;
        }

        match self.state {
            CircuitState::Closed => {
                if self.failure_count > 0 {
                    debug!("Circuit breaker: resetting failure count after success");
                    self.failure_count = 0;
                }
            }
            CircuitState::HalfOpen => {
                self.probe_in_flight = false;
                self.success_count += 1;
                if self.success_count >= self.config.success_threshold {
                    info!(
                        "Circuit breaker: {} probe success(es), closing circuit",
                        self.success_count
                    );
                    self.close();
                } else {
                    debug!(
                        "Circuit breaker: probe success {}/{}",
                        self.success_count, self.config.success_threshold
                    );
                }
            }
            CircuitState::Open => {
                debug!("Circuit breaker: late success recorded while open, ignoring");
            }
        }
    }

    fn record_failure(&mut self, error: &GmailError) {
        if !self.config.enabled {
            return;
        }

        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                debug!(
                    "Circuit breaker: failure {}/{} in closed state: {}",
                    self.failure_count, self.config.failure_threshold, error
                );

                if self.failure_count >= self.config.failure_threshold {
                    warn!(
                        "Circuit breaker: threshold reached ({} failures), opening circuit for {} seconds",
                        self.failure_count, self.config.reset_timeout_secs
                    );
                    self.open();
                }
            }
            CircuitState::HalfOpen => {
                self.failure_count += 1;
                warn!("Circuit breaker: probe failed ({}), reopening circuit", error);
                self.open();
            }
            CircuitState::Open => {
                debug!("Circuit breaker: failure recorded while circuit is already open");
            }
        }
    }
}

/// Thread-safe circuit breaker; clones share state
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(CircuitBreakerState::new(config))),
        }
    }

    /// Breaker that never trips
    pub fn disabled() -> Self {
        Self::new(CircuitBreakerConfig {
            enabled: false,
            ..CircuitBreakerConfig::default()
        })
    }

    /// Admit or reject a request, moving Open to HalfOpen once the cooldown has passed
    pub async fn check_request(&self) -> Result<()> {
        self.state.lock().await.should_allow_request().map(|_| ())
    }

    pub async fn record_success(&self) {
        self.state.lock().await.record_success();
    }

    pub async fn record_failure(&self, error: &GmailError) {
        self.state.lock().await.record_failure(error);
    }

    pub async fn state(&self) -> CircuitState {
        self.state.lock().await.state
    }

    /// Run `operation` behind the breaker.
    ///
    /// When the circuit is open and cooling down the operation is not invoked
    /// and [`GmailError::CircuitBreakerOpen`] is returned.
    pub async fn call<T, F, Fut, E>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<GmailError>,
    {
        let trial = self.state.lock().await.should_allow_request()?;
        let mut guard = TrialGuard {
            state: &self.state,
            armed: trial,
        };

        let outcome = operation().await;
        guard.armed = false;

        match outcome {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(e) => {
                let error: GmailError = e.into();
                self.record_failure(&error).await;
                Err(error)
            }
        }
    }

    /// Force the circuit closed
    pub async fn reset(&self) {
        self.state.lock().await.close();
        debug!("Circuit breaker manually reset to closed state");
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock().await;
        CircuitBreakerStats {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            open_for_secs: state.opened_at.map(|t| t.elapsed().as_secs()),
        }
    }
}

/// Frees the half-open slot if the trial request is dropped before it finishes
struct TrialGuard<'a> {
    state: &'a Arc<Mutex<CircuitBreakerState>>,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        match self.state.try_lock() {
            Ok(mut state) => state.release_trial(),
            Err(_) => {
                let state = Arc::clone(self.state);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move { state.lock().await.release_trial() });
                }
            }
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Seconds since the circuit last opened
    pub open_for_secs: Option<u64>,
}
