//! Cluster API access: typed object models and the narrow client surface the controller uses.

mod http;
mod mem;
mod objects;
mod traits;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use http::*;
pub use mem::*;
pub use objects::*;
pub use traits::*;
