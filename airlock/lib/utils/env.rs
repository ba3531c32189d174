//! Environment variables used by airlock.

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Environment variable for overriding the airlock home directory
pub const AIRLOCK_HOME_ENV_VAR: &str = "AIRLOCK_HOME";
