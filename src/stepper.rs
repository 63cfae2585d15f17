//! Stepwise hue convergence against an increment/decrement device primitive.

use crate::color::{StepDirection, StepPlan, wrap_add};
use crate::via::ViaError;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// The device primitive the stepper drives. Each `step_hue` call moves the
/// hue by the firmware's configured step size in the given direction.
pub trait HueDevice {
    fn read_hue(&mut self) -> impl Future<Output = Result<u8, ViaError>> + Send;
    fn step_hue(
        &mut self,
        direction: StepDirection,
    ) -> impl Future<Output = Result<(), ViaError>> + Send;
    fn save(&mut self) -> impl Future<Output = Result<(), ViaError>> + Send;
}

/// Walks the device hue toward `target` along the shorter arc.
///
/// Reads the current hue once, then issues one step call per `step_size`
/// units of remaining distance, sleeping `delay` between consecutive calls
/// (the tool applies one VIA keycode per call and needs pacing). Lands
/// within `step_size - 1` of the target, since the device cannot express a
/// sub-step move. Any read or step failure aborts immediately; retries are
/// the caller's concern, applied to the whole convergence.
///
/// With `save` set, one EEPROM-save call is issued after a successful walk;
/// a save failure is logged but the applied hue stands, so the result is
/// still `Ok`.
///
/// Returns the expected final hue.
pub async fn converge<D: HueDevice>(
    device: &mut D,
    target: u8,
    step_size: u8,
    delay: Duration,
    save: bool,
) -> Result<u8, ViaError> {
    let current = device.read_hue().await?;
    let plan = StepPlan::between(current, target, step_size.max(1));

    debug!(
        current,
        target,
        direction = %plan.direction,
        steps = plan.steps,
        remainder = plan.remainder,
        "converging hue"
    );

    for issued in 0..plan.steps {
        if issued > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        device.step_hue(plan.direction).await?;
    }

    let delta = match plan.direction {
        StepDirection::Up => i32::from(plan.travel(step_size.max(1))),
        StepDirection::Down => -i32::from(plan.travel(step_size.max(1))),
    };
    let landed = wrap_add(current, delta);

    if save {
        if let Err(e) = device.save().await {
            warn!(error = %e, "hue applied but EEPROM save failed");
        }
    }

    Ok(landed)
}
