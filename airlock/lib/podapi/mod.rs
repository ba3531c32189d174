//! The in-pod control endpoint: claim handoff, investigation intake, and artifact downloads.

mod api;
mod files;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use api::*;
pub use files::*;
