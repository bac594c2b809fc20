//! Core daemon logic: configuration, scanning, watching, fingerprinting,
//! uploading, and the worker runtime.

pub mod config;
pub mod daemon;
pub mod events;
pub mod fingerprint;
pub mod netinfo;
pub mod scanner;
pub mod uploader;
pub mod watcher;
