//! Claim coordination: exclusivity, token delivery, and the claim/release flows.

mod coordinator;
mod delivery;
mod registry;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use coordinator::*;
pub use delivery::*;
pub use registry::*;
