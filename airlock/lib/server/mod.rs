//! The controller REST API: claiming, releasing, and inspecting sandboxes over HTTP.

mod api;
mod data;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use api::*;
pub use data::*;
