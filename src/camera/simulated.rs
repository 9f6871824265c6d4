//! Simulated camera: `camstack-simworker` behind a control segment.
//!
//! Behaves like an SDK camera (geometry preloaded, parameters round-tripped,
//! readiness on the first post) but also passes the window on the command
//! line, so the worker does not depend on the preload.

use super::params::{ParamDialect, ParamsCamera};
use crate::modes::{CameraMode, ModeTable};

/// Built-in simulated modes.
pub fn modes() -> ModeTable {
    ModeTable::new()
        .with("FULL", CameraMode::new(0, 319, 0, 255))
        .with("HALF", CameraMode::new(80, 239, 64, 191))
        .with("QUARTER", CameraMode::new(120, 199, 96, 159))
}

/// Control-segment backend with the simulated dialect.
pub fn backend() -> ParamsCamera {
    ParamsCamera::new(ParamDialect::simulated())
}
