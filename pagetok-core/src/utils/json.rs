use std::{fs, path::Path};

use serde_json::Value;
use tracing::{debug, warn};

/// Read a JSON config file, treating a missing or malformed file as absent.
pub(crate) fn read_json_file(path: &Path) -> Option<Value> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) => {
            debug!("Skipping `{}`: {e}", path.display());
            return None;
        }
    };
    match serde_json::from_slice(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("Could not parse `{}` as JSON: {e}", path.display());
            None
        }
    }
}
