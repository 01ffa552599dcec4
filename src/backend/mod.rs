//! The supervised backend process

pub mod process;
pub mod supervisor;

pub use process::{
    BackendHandle, BackendLauncher, HttpProbe, LivenessProbe, ProcessLauncher, ensure_port_free,
    wait_for_ready,
};
pub use supervisor::{BackendState, Supervisor};
