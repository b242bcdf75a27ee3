use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Mutex, PoisonError},
};

use once_cell::sync::Lazy;
use tracing::info;

static LOGGED_NOTICES: Lazy<Mutex<Vec<u64>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// Log `msg` at info level the first time it is seen in this process.
pub fn once_log_info<M: AsRef<str>>(msg: M) {
    let msg = msg.as_ref();
    let mut hasher = DefaultHasher::new();
    msg.hash(&mut hasher);
    let hash = hasher.finish();

    let mut logged = LOGGED_NOTICES
        .lock()
        .unwrap_or_else(PoisonError::into_inner);
    if !logged.contains(&hash) {
        info!("{msg}");
        logged.push(hash);
    }
}
