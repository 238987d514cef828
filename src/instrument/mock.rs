//! Mock instrument endpoints that generate synthetic data.
//!
//! `MockDac` behaves like a ramped voltage source, `MockDmm` like a meter
//! that can optionally track a DAC output with noise. `FailingParameter`
//! simulates a dead hardware link for failure-path tests.

use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::error::{AppResult, SweepError};
use crate::parameter::{GettableParameter, Rampable, SettableParameter};

/// Ramp constraints shared between `set` calls.
#[derive(Debug, Clone, Copy, Default)]
struct RampConfig {
    step: Option<f64>,
    inter_delay: Duration,
}

/// A settable voltage-source endpoint with optional ramping.
pub struct MockDac {
    name: String,
    value: Arc<Mutex<f64>>,
    ramp: Mutex<RampConfig>,
    /// Setpoints seen by the hardware, in write order.
    history: Mutex<Vec<f64>>,
}

impl MockDac {
    /// A DAC starting at 0 V with no ramp constraints.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: Arc::new(Mutex::new(0.0)),
            ramp: Mutex::new(RampConfig::default()),
            history: Mutex::new(Vec::new()),
        }
    }

    /// Current output value.
    pub fn value(&self) -> f64 {
        *self.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every target setpoint written so far, in order.
    pub fn history(&self) -> Vec<f64> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Shared handle to the output value, for wiring a `MockDmm` to it.
    pub fn output(&self) -> Arc<Mutex<f64>> {
        Arc::clone(&self.value)
    }

    fn store(&self, value: f64) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }
}

#[async_trait]
impl SettableParameter for MockDac {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set(&self, target: f64) -> AppResult<()> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(target);

        let ramp = *self.ramp.lock().unwrap_or_else(|e| e.into_inner());
        match ramp.step {
            Some(step) if step > 0.0 => {
                // Slew toward the target in driver-enforced increments.
                let mut current = self.value();
                while (target - current).abs() > step {
                    current += step.copysign(target - current);
                    self.store(current);
                    sleep(ramp.inter_delay).await;
                }
                self.store(target);
            }
            _ => self.store(target),
        }
        debug!(dac = %self.name, value = target, "setpoint applied");
        Ok(())
    }
}

impl Rampable for MockDac {
    fn set_step(&self, step: f64) {
        self.ramp.lock().unwrap_or_else(|e| e.into_inner()).step = Some(step);
    }

    fn set_inter_delay(&self, delay: Duration) {
        self.ramp
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .inter_delay = delay;
    }
}

enum DmmSource {
    Constant(f64),
    /// Reads `scale * tracked + noise`.
    Tracking {
        tracked: Arc<Mutex<f64>>,
        scale: f64,
        noise: f64,
    },
    /// Returns `start + count * increment`, advancing per read.
    Counter {
        start: f64,
        increment: f64,
        count: AtomicUsize,
    },
}

/// A gettable meter endpoint.
pub struct MockDmm {
    name: String,
    source: DmmSource,
}

impl MockDmm {
    /// A meter that always reads `value`.
    pub fn constant(name: impl Into<String>, value: f64) -> Self {
        Self {
            name: name.into(),
            source: DmmSource::Constant(value),
        }
    }

    /// A meter reading `scale * source + noise`, e.g. a DMM across a device
    /// driven by a `MockDac` (see [`MockDac::output`]).
    pub fn tracking(
        name: impl Into<String>,
        tracked: Arc<Mutex<f64>>,
        scale: f64,
        noise: f64,
    ) -> Self {
        Self {
            name: name.into(),
            source: DmmSource::Tracking {
                tracked,
                scale,
                noise,
            },
        }
    }

    /// A meter whose reading advances by `increment` on every read.
    /// Deterministic, handy for ordering assertions in tests.
    pub fn counter(name: impl Into<String>, start: f64, increment: f64) -> Self {
        Self {
            name: name.into(),
            source: DmmSource::Counter {
                start,
                increment,
                count: AtomicUsize::new(0),
            },
        }
    }
}

#[async_trait]
impl GettableParameter for MockDmm {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> AppResult<f64> {
        let value = match &self.source {
            DmmSource::Constant(v) => *v,
            DmmSource::Tracking {
                tracked,
                scale,
                noise,
            } => {
                let base = *tracked.lock().unwrap_or_else(|e| e.into_inner());
                let jitter = if *noise > 0.0 {
                    rand::thread_rng().gen_range(-*noise..*noise)
                } else {
                    0.0
                };
                scale * base + jitter
            }
            DmmSource::Counter {
                start,
                increment,
                count,
            } => {
                let n = count.fetch_add(1, Ordering::SeqCst);
                start + n as f64 * increment
            }
        };
        Ok(value)
    }
}

/// An endpoint whose hardware link is dead: every call fails, optionally
/// after a number of good reads.
pub struct FailingParameter {
    name: String,
    good_reads: AtomicUsize,
    value: f64,
}

impl FailingParameter {
    /// Fails on the very first access.
    pub fn new(name: impl Into<String>) -> Self {
        Self::after(name, 0, 0.0)
    }

    /// Returns `value` for the first `good_reads` reads, then fails.
    pub fn after(name: impl Into<String>, good_reads: usize, value: f64) -> Self {
        Self {
            name: name.into(),
            good_reads: AtomicUsize::new(good_reads),
            value,
        }
    }

    fn fail(&self) -> SweepError {
        SweepError::Instrument(format!("{}: no response from instrument", self.name))
    }
}

#[async_trait]
impl GettableParameter for FailingParameter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self) -> AppResult<f64> {
        let remaining = self.good_reads.load(Ordering::SeqCst);
        if remaining > 0 {
            self.good_reads.store(remaining - 1, Ordering::SeqCst);
            Ok(self.value)
        } else {
            Err(self.fail())
        }
    }
}

#[async_trait]
impl SettableParameter for FailingParameter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn set(&self, _value: f64) -> AppResult<()> {
        Err(self.fail())
    }
}
