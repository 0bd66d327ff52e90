//! Engine construction and event collection helpers

use smu_daq::engine::{EngineEvents, EngineSettings, MeasurementEngine};
use smu_daq::instrument::InstrumentFactory;
use smu_daq::types::SessionEvent;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Engine writing generated file names into a fresh temporary directory
pub fn engine_in_tempdir(
    factory: impl InstrumentFactory + 'static,
) -> (MeasurementEngine, EngineEvents, TempDir) {
    let dir = TempDir::new().expect("create temp dir");
    let settings = EngineSettings {
        output_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let (engine, events) = MeasurementEngine::new(settings, factory);
    (engine, events, dir)
}

/// Receive events until `SessionEnded` or the timeout
pub fn collect_until_end(events: &EngineEvents, timeout: Duration) -> Vec<SessionEvent> {
    let deadline = Instant::now() + timeout;
    let mut received = Vec::new();
    while let Some(event) =
        events.recv_timeout(deadline.saturating_duration_since(Instant::now()))
    {
        let done = event.is_session_end();
        received.push(event);
        if done {
            break;
        }
    }
    received
}
