//! # camstack
//!
//! Supervisor for scientific cameras in an adaptive-optics bench. A camera is
//! an acquisition worker (a separate process owning the vendor handle and
//! publishing frames into a shared-memory image stream) plus the auxiliary
//! processes that consume that stream. The supervisor keeps them consistent
//! across mode changes.
//!
//! ## Crate Structure
//!
//! - **`modes`**: named region-of-interest presets and the per-family mode tables.
//! - **`session`**: persistent named shell sessions (tmux, local or over ssh) and an
//!   in-memory mock used by the tests.
//! - **`dependents`**: the processes coupled to the camera's geometry, their start and
//!   kill ordering and their real-time placement.
//! - **`shm`**: the memory-mapped image/keyword segments.
//! - **`worker`**: launch, readiness and kill of the acquisition worker, its command line
//!   and the control-segment parameter mailbox. `worker::sim` is the simulated worker.
//! - **`keywords`**: the formatted header keywords, the external store mirror and the
//!   polling task.
//! - **`camera`**: the supervisor state machine and the camera families.
//! - **`rpc`**: the operation table served over TCP and in the interactive shell.
//! - **`config`**, **`logging`**, **`error`**: configuration, tracing setup and the
//!   error taxonomy.

pub mod camera;
pub mod config;
pub mod dependents;
pub mod error;
pub mod keywords;
pub mod logging;
pub mod modes;
pub mod rpc;
pub mod session;
pub mod shm;
pub mod worker;

pub use camera::{CameraSupervisor, SupervisorState};
pub use config::CamstackConfig;
pub use error::{AppResult, CamstackError};
