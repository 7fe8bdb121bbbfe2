//! Where `epgcache` looks for `config.toml`.

use std::ffi::OsString;
use std::path::PathBuf;

use anyhow::{Context, Result};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Resolves the config file path.
///
/// `--dir` wins. Otherwise `$XDG_CONFIG_HOME/epgcache/config.toml` when that
/// variable holds an absolute path, then `~/.config/epgcache/config.toml`.
///
/// # Errors
///
/// Returns an error if `dir` is `None` and neither `XDG_CONFIG_HOME` nor
/// `HOME` is usable.
pub fn resolve_config_path(dir: Option<&PathBuf>) -> Result<PathBuf> {
    config_path_from(
        dir,
        std::env::var_os("XDG_CONFIG_HOME"),
        std::env::var_os("HOME"),
    )
}

fn config_path_from(
    dir: Option<&PathBuf>,
    xdg_config_home: Option<OsString>,
    home: Option<OsString>,
) -> Result<PathBuf> {
    if let Some(d) = dir {
        return Ok(d.join(CONFIG_FILE_NAME));
    }

    // Relative XDG values are invalid and ignored.
    let base = xdg_config_home
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| home.map(|h| PathBuf::from(h).join(".config")))
        .context("neither XDG_CONFIG_HOME nor HOME is set")?;
    Ok(base.join("epgcache").join(CONFIG_FILE_NAME))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_dir_overrides_environment() {
        // Arrange
        let dir = PathBuf::from("/srv/epg");

        // Act
        let path = config_path_from(
            Some(&dir),
            Some(OsString::from("/xdg")),
            Some(OsString::from("/home/u")),
        )
        .unwrap();

        // Assert
        assert_eq!(path, PathBuf::from("/srv/epg/config.toml"));
    }

    #[test]
    fn test_xdg_config_home_preferred_over_home() {
        // Arrange & Act
        let path = config_path_from(
            None,
            Some(OsString::from("/xdg")),
            Some(OsString::from("/home/u")),
        )
        .unwrap();

        // Assert
        assert_eq!(path, PathBuf::from("/xdg/epgcache/config.toml"));
    }

    #[test]
    fn test_relative_xdg_falls_back_to_home() {
        // Arrange & Act
        let path = config_path_from(
            None,
            Some(OsString::from("relative/cfg")),
            Some(OsString::from("/home/u")),
        )
        .unwrap();

        // Assert
        assert_eq!(path, PathBuf::from("/home/u/.config/epgcache/config.toml"));
    }

    #[test]
    fn test_no_environment_is_an_error() {
        // Arrange & Act
        let result = config_path_from(None, None, None);

        // Assert
        assert!(result.is_err());
    }
}
