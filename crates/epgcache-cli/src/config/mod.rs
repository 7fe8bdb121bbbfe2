//! `config.toml` for the `epgcache` binary.
//!
//! Missing files and missing tables fall back to defaults. Command-line
//! flags override whatever the file says.

#[allow(clippy::module_inception)]
mod config;
mod paths;

#[allow(clippy::module_name_repetitions)]
pub use config::AppConfig;
pub use paths::resolve_config_path;
