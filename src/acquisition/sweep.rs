//! Triangular voltage sweep
//!
//! The path runs start → end → start. Each leg advances by `voltage_step`;
//! the last point of a leg is clamped to the exact target, so it may be a
//! shorter step. The turning point is measured once. A zero-span sweep
//! measures the same voltage once per direction.

use super::{Outcome, SessionContext};
use crate::types::{Progress, SweepParameters};

/// Voltages of one outbound leg, both ends included
fn leg(params: &SweepParameters) -> Vec<f64> {
    let points = params.points_per_leg();
    let direction = if params.end_voltage >= params.start_voltage {
        1.0
    } else {
        -1.0
    };
    (0..points)
        .map(|k| {
            if k + 1 == points {
                params.end_voltage
            } else {
                params.start_voltage + k as f64 * params.voltage_step * direction
            }
        })
        .collect()
}

/// Full triangular path for a sweep
pub fn sweep_voltages(params: &SweepParameters) -> Vec<f64> {
    let outbound = leg(params);
    if outbound.len() == 1 {
        return vec![outbound[0]; 2];
    }
    let mut path = Vec::with_capacity(outbound.len() * 2 - 1);
    path.extend_from_slice(&outbound);
    path.extend(outbound.iter().rev().skip(1));
    path
}

pub(crate) fn run(ctx: &mut SessionContext<'_>, params: &SweepParameters) -> Outcome {
    let voltages = sweep_voltages(params);
    let total = voltages.len();
    let dwell = params.dwell();
    tracing::debug!(
        "Sweeping {} V → {} V → {} V in {} points",
        params.start_voltage,
        params.end_voltage,
        params.start_voltage,
        total
    );

    for (i, &voltage) in voltages.iter().enumerate() {
        if ctx.cancel.is_cancelled() {
            tracing::info!("Sweep cancelled after {} of {} points", i, total);
            return Outcome::Cancelled;
        }

        if let Err(e) = ctx.instrument.source_voltage(voltage) {
            if let Err(cause) = ctx.point_failed(e) {
                return Outcome::Fatal(cause);
            }
        } else {
            std::thread::sleep(dwell);
            let timestamp = ctx.elapsed();
            match ctx.instrument.measure_current() {
                Ok(current) => {
                    ctx.reading_succeeded();
                    ctx.emit_sample(timestamp, Some(voltage), current);
                }
                Err(e) => {
                    if let Err(cause) = ctx.point_failed(e) {
                        return Outcome::Fatal(cause);
                    }
                }
            }
        }

        ctx.emit_progress(Progress::Fraction((i + 1) as f64 / total as f64));
    }

    Outcome::Completed
}
