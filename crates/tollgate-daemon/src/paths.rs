//! XDG-compliant path helpers.
//!
//! Respects `XDG_CONFIG_HOME` and `XDG_DATA_HOME` environment
//! variables, falling back to `~/.config` and `~/.local/share`.
//!
//! ```text
//! $XDG_CONFIG_HOME/tollgate/config.toml
//! $XDG_DATA_HOME/tollgate/
//! ├── secrets/             (local provider root)
//! ├── audit/YYYY-MM-DD.jsonl
//! └── tollgate.sock
//! ```

use std::path::{Path, PathBuf};

use tollgate_secrets::ReadEnv;

const APP_DIR: &str = "tollgate";

/// Returns the XDG config base directory.
///
/// Uses `XDG_CONFIG_HOME` if set, otherwise `~/.config`.
pub fn config_dir(env: &dyn ReadEnv) -> Option<PathBuf> {
    env.var("XDG_CONFIG_HOME")
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
}

/// Returns the XDG data base directory.
///
/// Uses `XDG_DATA_HOME` if set, otherwise `~/.local/share`.
pub fn data_dir(env: &dyn ReadEnv) -> Option<PathBuf> {
    env.var("XDG_DATA_HOME")
        .ok()
        .filter(|dir| !dir.is_empty())
        .map(PathBuf::from)
        .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
}

/// Filesystem locations used by the daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// `$XDG_DATA_HOME`.
    pub data_home: PathBuf,
    /// `$XDG_DATA_HOME/tollgate`; file-backed providers default to children of it.
    pub state_dir: PathBuf,
}

impl Paths {
    /// Resolves paths from the environment.
    #[must_use]
    pub fn resolve(env: &dyn ReadEnv) -> Option<Self> {
        data_dir(env).map(Self::under)
    }

    /// Paths rooted at an explicit data directory.
    #[must_use]
    pub fn under(data_home: impl Into<PathBuf>) -> Self {
        let data_home = data_home.into();
        let state_dir = data_home.join(APP_DIR);
        Self {
            data_home,
            state_dir,
        }
    }

    #[must_use]
    pub fn socket_path(&self) -> PathBuf {
        self.state_dir.join("tollgate.sock")
    }

    #[must_use]
    pub fn audit_dir(&self) -> PathBuf {
        self.state_dir.join("audit")
    }

    #[must_use]
    pub fn data_home(&self) -> &Path {
        &self.data_home
    }
}

/// Default configuration file: `$XDG_CONFIG_HOME/tollgate/config.toml`.
pub fn default_config_path(env: &dyn ReadEnv) -> Option<PathBuf> {
    config_dir(env).map(|dir| dir.join(APP_DIR).join("config.toml"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use tollgate_secrets::MapEnv;

    use super::*;

    #[test]
    fn test_xdg_overrides() {
        let env = MapEnv::new()
            .with("XDG_CONFIG_HOME", "/tmp/cfg")
            .with("XDG_DATA_HOME", "/tmp/data");

        assert_eq!(
            default_config_path(&env).unwrap(),
            PathBuf::from("/tmp/cfg/tollgate/config.toml")
        );

        let paths = Paths::resolve(&env).unwrap();
        assert_eq!(paths.socket_path(), PathBuf::from("/tmp/data/tollgate/tollgate.sock"));
        assert_eq!(paths.audit_dir(), PathBuf::from("/tmp/data/tollgate/audit"));
        assert_eq!(paths.data_home(), Path::new("/tmp/data"));
    }

    #[test]
    fn test_empty_override_is_ignored() {
        let env = MapEnv::new().with("XDG_DATA_HOME", "");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(data_dir(&env).unwrap(), home.join(".local/share"));
        }
    }
}
