use std::{env, path::PathBuf};

use typed_path::{Utf8UnixComponent, Utf8UnixPathBuf};

use crate::{
    config::DEFAULT_AIRLOCK_HOME, utils::AIRLOCK_HOME_ENV_VAR, AirlockError, AirlockResult,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The filename of the Ed25519 claim-token signing key under the airlock home directory
pub const SIGNING_KEY_FILENAME: &str = "signing.key";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns the airlock home directory, honoring the `AIRLOCK_HOME` override.
pub fn airlock_home_path() -> PathBuf {
    env::var(AIRLOCK_HOME_ENV_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| DEFAULT_AIRLOCK_HOME.to_owned())
}

/// Normalizes a path string for comparison and containment checks.
///
/// Rules:
/// - Resolves `.` and `..` components where possible
/// - Prevents path traversal that would escape the root
/// - Removes redundant separators and trailing slashes
/// - Can require absolute paths (for configured roots)
///
/// Returns an error if the path is invalid, would escape root, or doesn't meet the absolute
/// requirement.
pub fn normalize_path(path: &str, require_absolute: bool) -> AirlockResult<String> {
    if path.is_empty() {
        return Err(AirlockError::PathValidation(
            "Path cannot be empty".to_string(),
        ));
    }

    let path = Utf8UnixPathBuf::from(path);
    let mut normalized = Vec::new();
    let mut is_absolute = false;
    let mut depth = 0;

    for component in path.components() {
        match component {
            // Root component must come first if present
            Utf8UnixComponent::RootDir => {
                if normalized.is_empty() {
                    is_absolute = true;
                    normalized.push("/".to_string());
                } else {
                    return Err(AirlockError::PathValidation(
                        "Invalid path: root component '/' found in middle of path".to_string(),
                    ));
                }
            }
            Utf8UnixComponent::ParentDir => {
                if depth > 0 {
                    normalized.pop();
                    depth -= 1;
                } else {
                    return Err(AirlockError::PathValidation(
                        "Invalid path: cannot traverse above root directory".to_string(),
                    ));
                }
            }
            Utf8UnixComponent::CurDir => continue,
            Utf8UnixComponent::Normal(c) => {
                if !c.is_empty() {
                    normalized.push(c.to_string());
                    depth += 1;
                }
            }
        }
    }

    if require_absolute && !is_absolute {
        return Err(AirlockError::PathValidation(
            "Path must be absolute (start with '/')".to_string(),
        ));
    }

    if is_absolute {
        if normalized.len() == 1 {
            Ok("/".to_string())
        } else {
            Ok(format!("/{}", normalized[1..].join("/")))
        }
    } else {
        Ok(normalized.join("/"))
    }
}

/// Resolves a requested path against a root directory and verifies containment.
///
/// Absolute requests must already sit under the root; relative requests are joined onto it.
/// Either way the result is normalized first, so `..` sequences cannot step outside the root.
pub fn resolve_within_root(root: &str, requested: &str) -> AirlockResult<String> {
    let normalized_root = normalize_path(root, true)?;

    if requested.starts_with('/') {
        let normalized_requested = normalize_path(requested, true)?;
        if normalized_requested != normalized_root
            && !normalized_requested.starts_with(&format!("{}/", normalized_root))
        {
            return Err(AirlockError::PathValidation(format!(
                "Path '{}' is outside root '{}'",
                normalized_requested, normalized_root
            )));
        }
        Ok(normalized_requested)
    } else {
        let normalized_requested = normalize_path(requested, false)?;
        let full_path = format!("{}/{}", normalized_root, normalized_requested);
        normalize_path(&full_path, true)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
