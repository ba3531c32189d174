//! The sandbox record, its lifecycle state machine, and its pod encoding.

mod record;
mod state;
mod store;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use record::*;
pub use state::*;
pub use store::*;
