//! Feedback control law for CPU recommendations

use super::state::ControllerState;
use super::ResourcePolicy;
use crate::crd::{ContainerScale, ServiceLevelAgreementSpec};
use crate::error::ScaleError;
use crate::models::{ResourceKind, ResourceVector, ResponseTimeSample};
use k8s_openapi::api::core::v1::Pod;

/// Integral gain
pub const BC: f64 = 100.0;

/// Proportional gain
pub const DC: f64 = 100.0;

/// Floor of the core estimate in milli-cores
pub const MIN_CPU_MILLICORES: f64 = 50.0;

/// A cycle may at most multiply the previous core estimate by this factor
pub const MAX_SCALE_OUT: f64 = 3.0;

/// Value clamped into a closed interval
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bounded {
    pub value: i64,
    pub clamped: bool,
}

/// Clamp `value` into `[lo, hi]`; inverted bounds are a configuration error
pub fn bound(value: i64, lo: i64, hi: i64, kind: ResourceKind) -> Result<Bounded, ScaleError> {
    if lo > hi {
        return Err(ScaleError::InvalidBounds {
            kind,
            min: lo,
            max: hi,
        });
    }
    let clamped_value = value.clamp(lo, hi);
    Ok(Bounded {
        value: clamped_value,
        clamped: clamped_value != value,
    })
}

/// Advance the controller one step and return the raw core estimate
///
/// Rate ceiling first, `MIN_CPU_MILLICORES` floor last, so a zero previous
/// estimate still yields the floor.
pub fn step(state: &mut ControllerState, setpoint_secs: f64, measured_secs: f64) -> f64 {
    let e = 1.0 / setpoint_secs - 1.0 / measured_secs;
    let xc = state.integral + BC * e;
    let old_cores = state.cores;

    state.cores = (xc + DC * e)
        .min(old_cores * MAX_SCALE_OUT)
        .max(MIN_CPU_MILLICORES);
    state.integral = state.cores - BC * e;
    state.cores
}

/// Discrete-time feedback controller on the inverse response time
///
/// CPU follows the control law; memory is passed through from the current
/// desired value and only bounded by the agreement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlTheoryPolicy;

impl ControlTheoryPolicy {
    pub fn new() -> Self {
        Self
    }
}

impl ResourcePolicy for ControlTheoryPolicy {
    fn name(&self) -> &'static str {
        "control-theory"
    }

    fn compute_resources(
        &self,
        _pod: &Pod,
        record: &ContainerScale,
        agreement: &ServiceLevelAgreementSpec,
        sample: &ResponseTimeSample,
        state: &mut ControllerState,
    ) -> Result<ResourceVector, ScaleError> {
        agreement.validate()?;
        let (min, max) = (agreement.min_resources, agreement.max_resources);

        let cores = step(state, agreement.setpoint_seconds(), sample.seconds());
        let cpu = bound(
            cores.round() as i64,
            min.cpu_millicores,
            max.cpu_millicores,
            ResourceKind::Cpu,
        )?;

        let memory = bound(
            record.spec.desired_resources.memory_bytes,
            min.memory_bytes,
            max.memory_bytes,
            ResourceKind::Memory,
        )?;

        Ok(ResourceVector::new(cpu.value, memory.value))
    }
}
