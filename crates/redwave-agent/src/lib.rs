pub mod config;
pub mod error;
pub mod event_bus;
pub mod http;
pub mod log_buffer;
pub mod manager;
pub mod provisioner;
pub mod registry;
pub mod supervisor;
pub mod templates;

#[cfg(test)]
mod test_support;

pub use config::PanelConfig;
pub use error::{ErrorPayload, PanelError};
pub use manager::InstanceManager;
