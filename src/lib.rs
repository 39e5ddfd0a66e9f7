//! Core library for the Overcast host orchestrator.
//!
//! Overcast acquires throwaway hosts for integration tests from one of seven
//! backends (an existing machine, a cloud instance, a Vagrant box, a
//! VirtualBox snapshot, a libvirt clone, a Docker container, or a vSphere
//! clone), waits for their address,
//! optionally tunnels and provisions them, and tears them down again. The
//! [`lifecycle`] module drives every backend through the same state machine.

pub mod backend;
pub mod config;
pub mod drivers;
pub mod exec;
pub mod host_spec;
pub mod lifecycle;
pub mod provision;
pub mod resolve;
pub mod test_support;
pub mod tunnel;
pub mod wait;

pub use backend::{
    AddressSource, Backend, BackendError, BackendFactory, BackendKind, HostAddress, ImageCache,
    InstanceHandle, ProvisionReuse,
};
pub use config::{ConfigError, HostProperties, OvercastConfig};
pub use drivers::DriverFactory;
pub use host_spec::HostSpec;
pub use lifecycle::{
    Cancellation, Canceller, ErrorKind, HostHandle, HostOrchestrator, HostRegistry, HostState,
    LifecycleError, Session,
};
