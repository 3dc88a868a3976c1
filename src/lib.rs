//! Reconciles a desired SOCKS5 proxy state against an external,
//! eventually-consistent proxy configuration store, then verifies the applied
//! proxy is actually reachable.

pub mod apply_queue;
pub mod converge;
pub mod debounce;
pub mod desired_state;
pub mod engine;
pub mod error;
pub mod probe;
pub mod proxy_facts;
pub mod settings;
pub mod status;
pub mod store;
pub mod system;
pub mod validate;

#[cfg(test)]
pub(crate) mod testing;

pub use desired_state::DesiredState;
pub use engine::Engine;
pub use error::{ReconcileError, Result, StoreError};
pub use settings::Settings;
pub use status::{Reachability, StatusSnapshot};
pub use store::{ConfigurationStore, ControlLevel};
