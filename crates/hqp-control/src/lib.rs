//! HQPlayer control plane: the control-port client, profile stores and the
//! profile-switch orchestrator, bundled behind [`Controller`].

pub mod client;
pub mod controller;
pub mod exec;
pub mod store;
pub mod switch;

pub use client::{ClientOptions, ControlClient, Direction, ReadinessProbe};
pub use controller::{Controller, ProfileEntry};
pub use store::{LocalProfileStore, ProfileRef, ProfileStore, RemoteProfileStore};
pub use switch::{
    PollPolicy, SwitchLocks, SwitchOrchestrator, SwitchOutcome, SwitchPhase, SwitchResult,
};
