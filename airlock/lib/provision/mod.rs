//! Sandbox resource set construction and provisioning.

mod provisioner;
mod resources;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use provisioner::*;
pub use resources::*;
