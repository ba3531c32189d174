//! Configuration types, defaults, and validation.

mod airlock;
mod defaults;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use airlock::*;
pub use defaults::*;
