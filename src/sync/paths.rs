//! Path resolution for maintsync directories.
//!
//! Follows XDG: `$XDG_DATA_HOME/maintsync`, else `~/.local/share/maintsync`.

use std::env;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "maintsync";

/// Get the XDG-compliant data directory.
///
/// Falls back to a relative `.local/share` when neither `XDG_DATA_HOME`
/// nor `HOME` is set.
pub fn get_data_dir() -> PathBuf {
    data_dir_from(
        env::var_os("XDG_DATA_HOME").as_deref().map(Path::new),
        env::var_os("HOME").as_deref().map(Path::new),
    )
}

/// Get the queue database path (data_dir/queue.db).
pub fn get_db_path() -> PathBuf {
    get_data_dir().join("queue.db")
}

pub(crate) fn data_dir_from(xdg_data_home: Option<&Path>, home: Option<&Path>) -> PathBuf {
    let base = match (xdg_data_home, home) {
        (Some(xdg), _) if !xdg.as_os_str().is_empty() => xdg.to_path_buf(),
        (_, Some(home)) => home.join(".local/share"),
        _ => PathBuf::from(".local/share"),
    };
    base.join(APP_DIR)
}
