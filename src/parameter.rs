//! Parameter abstractions over instrument endpoints.
//!
//! The orchestrator never talks to hardware directly; it drives trait
//! objects wrapping whatever the instrument layer exposes:
//!
//! - [`GettableParameter`]: a read-only measured quantity (DMM voltage,
//!   lock-in X, temperature).
//! - [`SettableParameter`]: a quantity that can be driven through setpoints
//!   (DAC output, magnet current).
//! - [`Rampable`]: optional capability for settables whose driver enforces a
//!   maximum step size and an inter-step delay when slewing. The sweep
//!   engine never re-implements ramping; it only configures the capability
//!   where the endpoint exposes it.
//!
//! [`FollowedParameter`] is the adapter registered with a
//! [`Station`](crate::station::Station): it pairs a gettable endpoint with a
//! gain divisor compensating for external amplification, so stored rows are
//! in instrument-input units. Errors from the underlying endpoint propagate
//! unchanged; the adapter adds no retry logic.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{AppResult, SweepError};

/// A readable instrument endpoint producing scalar samples.
#[async_trait]
pub trait GettableParameter: Send + Sync {
    /// Display name used for the stored column and plot traces.
    fn name(&self) -> &str;

    /// Read the current raw value from the instrument.
    ///
    /// Blocking on the hardware link is expected; reads are issued one at a
    /// time by the acquisition loop.
    async fn get(&self) -> AppResult<f64>;
}

/// A writable instrument endpoint that can be driven through setpoints.
#[async_trait]
pub trait SettableParameter: Send + Sync {
    /// Display name used for the setpoint column.
    fn name(&self) -> &str;

    /// Drive the endpoint to `value`.
    ///
    /// If the endpoint ramps, `set` returns only once the ramp has been
    /// issued to the hardware; any inter-step delays happen inside the
    /// driver, independent of the sweep-step delay.
    async fn set(&self, value: f64) -> AppResult<()>;
}

/// Optional ramp-constraint capability for settable endpoints.
///
/// Endpoints without hardware ramp support simply do not implement this.
pub trait Rampable: SettableParameter {
    /// Maximum change per ramp step, in endpoint units.
    fn set_step(&self, step: f64);

    /// Minimum wait between successive ramp steps.
    fn set_inter_delay(&self, delay: Duration);
}

/// A followed parameter: a gettable endpoint plus gain correction.
///
/// Created at registration time and immutable for the duration of a run.
#[derive(Clone)]
pub struct FollowedParameter {
    param: Arc<dyn GettableParameter>,
    name: String,
    gain: f64,
}

impl FollowedParameter {
    /// Wrap `param` with the given gain divisor.
    ///
    /// Returns a configuration error unless `gain > 0`.
    pub fn new(param: Arc<dyn GettableParameter>, gain: f64) -> AppResult<Self> {
        if !(gain > 0.0) {
            return Err(SweepError::Configuration(format!(
                "gain for parameter '{}' must be positive, got {}",
                param.name(),
                gain
            )));
        }
        let name = param.name().to_string();
        Ok(Self { param, name, gain })
    }

    /// Column/trace name for this parameter.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configured gain divisor.
    pub fn gain(&self) -> f64 {
        self.gain
    }

    /// Read the endpoint and apply gain correction.
    pub async fn read(&self) -> AppResult<f64> {
        Ok(self.param.get().await? / self.gain)
    }
}

impl std::fmt::Debug for FollowedParameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FollowedParameter")
            .field("name", &self.name)
            .field("gain", &self.gain)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::mock::{FailingParameter, MockDmm};

    #[tokio::test]
    async fn test_gain_divides_reading() {
        let dmm = Arc::new(MockDmm::constant("v_sample", 5.0));
        let followed = FollowedParameter::new(dmm, 100.0).unwrap();
        let value = followed.read().await.unwrap();
        assert!((value - 0.05).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_default_style_gain_of_one() {
        let dmm = Arc::new(MockDmm::constant("v_sample", 2.5));
        let followed = FollowedParameter::new(dmm, 1.0).unwrap();
        assert_eq!(followed.read().await.unwrap(), 2.5);
    }

    #[test]
    fn test_nonpositive_gain_rejected() {
        let dmm = Arc::new(MockDmm::constant("v_sample", 0.0));
        assert!(FollowedParameter::new(dmm.clone(), 0.0).is_err());
        assert!(FollowedParameter::new(dmm, -2.0).is_err());
    }

    #[tokio::test]
    async fn test_instrument_error_propagates_unchanged() {
        let broken = Arc::new(FailingParameter::new("dead_dmm"));
        let followed = FollowedParameter::new(broken, 10.0).unwrap();
        let err = followed.read().await.unwrap_err();
        assert!(err.is_instrument());
    }
}
