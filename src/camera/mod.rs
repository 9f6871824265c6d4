//! Camera supervisor and the built-in camera families.
//!
//! - [`state`]: the lifecycle states
//! - [`hooks`]: the vendor-hook trait a family implements
//! - [`supervisor`]: the state machine driving worker, dependents and keywords
//! - [`simulated`], [`edt`], [`params`]: the families

pub mod edt;
pub mod hooks;
pub mod params;
pub mod simulated;
pub mod state;
pub mod supervisor;

pub use hooks::{CameraBackend, HookContext};
pub use state::SupervisorState;
pub use supervisor::{CameraSupervisor, Health};

use crate::config::{CameraConfig, CameraFamily};
use crate::modes::{CameraMode, ModeTable};
use params::{ParamDialect, ParamsCamera};

/// Built-in mode table of a family.
pub fn family_modes(family: CameraFamily) -> ModeTable {
    match family {
        CameraFamily::Simulated => simulated::modes(),
        CameraFamily::Edt | CameraFamily::AutoEdt => edt::modes(),
        CameraFamily::Dcam => ModeTable::new()
            .with("FULL", CameraMode::new(0, 4095, 0, 2303).with_tint(0.001))
            .with("K", CameraMode::new(1560, 2159, 980, 1279).with_tint(0.001))
            .with("K2", CameraMode::new(1760, 1959, 1080, 1179).with_tint(0.001)),
        CameraFamily::Pvcam => ModeTable::new()
            .with("FULL", CameraMode::new(0, 2047, 0, 2047).with_tint(0.01))
            .with("HALF", CameraMode::new(512, 1535, 512, 1535).with_tint(0.01))
            .with(
                "FULLBIN",
                CameraMode::new(0, 2047, 0, 2047)
                    .with_binning(2, 2)
                    .with_tint(0.01),
            ),
    }
}

/// Vendor hooks of the configured family.
pub fn backend_for(camera: &CameraConfig) -> Box<dyn CameraBackend> {
    match camera.family {
        CameraFamily::Simulated => Box::new(simulated::backend()),
        CameraFamily::Edt => Box::new(edt::EdtCamera::new(false)),
        CameraFamily::AutoEdt => Box::new(edt::EdtCamera::new(true)),
        CameraFamily::Dcam => Box::new(ParamsCamera::new(ParamDialect::dcam())),
        CameraFamily::Pvcam => Box::new(ParamsCamera::new(ParamDialect::pvcam())),
    }
}
