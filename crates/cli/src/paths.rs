//! Runtime file locations under the data directory.

use std::path::PathBuf;

use assist_core::config;

pub fn pid_path() -> PathBuf {
    config::data_dir().join("assist.pid")
}

pub fn log_path() -> PathBuf {
    config::data_dir().join("assist.log")
}
