//! Lifecycle supervision: deadlines, teardown, and drift repair.

mod supervisor;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use supervisor::*;
