//! Utility functions and types.

mod backoff;
mod env;
mod ident;
mod path;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use backoff::*;
pub use env::*;
pub use ident::*;
pub use path::*;
