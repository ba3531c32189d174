//! Claim token minting, verification, and revocation.

mod issuer;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use issuer::*;
