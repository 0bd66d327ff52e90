//! Open-ended current collection at a fixed bias
//!
//! Every `acquisition_interval` the worker takes `noise_average` consecutive
//! readings and reports their mean as one sample. With fast acquisition every
//! raw reading is forwarded as well. Runs until cancelled or faulted.
//!
//! Cancellation is checked before every reading; a partial average is
//! discarded.
//!
//! The next period is scheduled from the start of the current one, so sample
//! timestamps are never closer than the interval. A period that overruns is
//! followed immediately by the next.

use super::{Outcome, SessionContext};
use crate::types::{CollectionParameters, Progress, SessionEvent};
use std::time::Instant;

pub(crate) fn run(ctx: &mut SessionContext<'_>, params: &CollectionParameters) -> Outcome {
    if let Err(e) = ctx.instrument.source_voltage(params.bias_voltage) {
        return Outcome::Fatal(format!("Failed to apply bias: {}", e));
    }
    tracing::debug!(
        "Collecting at {} V, {} PLC, {} readings per sample every {:?}",
        params.bias_voltage,
        params.aperture_time,
        params.noise_average,
        params.interval()
    );

    let interval = params.interval();
    let mut deadline = Instant::now();

    loop {
        if !ctx.cancel.wait_until(deadline) {
            return Outcome::Cancelled;
        }
        let period_start = Instant::now();
        deadline = period_start + interval;

        let timestamp = period_start.duration_since(ctx.started);
        let mut sum = 0.0;
        let mut taken = 0u32;
        while taken < params.noise_average {
            if ctx.cancel.is_cancelled() {
                return Outcome::Cancelled;
            }
            match ctx.instrument.measure_current() {
                Ok(current) => {
                    ctx.reading_succeeded();
                    sum += current;
                    taken += 1;
                    if params.fast_acquisition {
                        let at = ctx.elapsed();
                        ctx.emit(SessionEvent::RawReading {
                            timestamp: at,
                            measured_current: current,
                        });
                    }
                }
                Err(e) => {
                    if let Err(cause) = ctx.point_failed(e) {
                        return Outcome::Fatal(cause);
                    }
                    break;
                }
            }
        }

        if taken == params.noise_average {
            ctx.emit_sample(timestamp, None, sum / taken as f64);
        }
        if Instant::now() > deadline {
            tracing::debug!("Collection period overran by {:?}", deadline.elapsed());
        }
        let elapsed = ctx.elapsed();
        ctx.emit_progress(Progress::Elapsed(elapsed));
    }
}
