//! Test doubles shared by the devbox crates.

mod engine;
mod recorder;

pub use engine::{EngineCall, FAKE_DIGEST, FakeEngine, FaultPoint, ScriptedExec, container_info};
pub use recorder::{EventRecorder, RecordedEvent};
