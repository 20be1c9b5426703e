//! Native runtime backends

pub mod acl_backend;
pub mod sim;

pub use acl_backend::{AclError, AclResult, DeviceDriver};
pub use sim::SimDriver;
