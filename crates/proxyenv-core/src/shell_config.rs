//! Persisting proxy variables for future shells.
//!
//! macOS and Linux keep a fenced block in the user's shell-startup file;
//! Windows uses the per-user environment store (see [`crate::env_store`]).

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use tempfile::NamedTempFile;
use tracing::{debug, info};

use crate::env_store::UserEnvironment;
use crate::error::{ProxyEnvError, Result};
use crate::fence;
use crate::model::{EnvironmentProxyState, ProxyVar};
use crate::platform::Platform;

/// A place where proxy variables are persisted.
pub trait ProxyEnvironment: Send + Sync {
    /// Writes `proxy_url` to every tracked variable, or removes them on `None`.
    fn apply(&self, proxy_url: Option<&str>) -> Result<()>;

    /// Reads what is currently persisted.
    fn read(&self) -> Result<EnvironmentProxyState>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

/// A shell-startup file with a managed proxy block.
#[derive(Debug, Clone)]
pub struct ShellProfile {
    path: PathBuf,
    vars: Vec<ProxyVar>,
}

impl ShellProfile {
    /// Manages the block in the file at `path`, exporting all six variables.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            vars: ProxyVar::ALL.to_vec(),
        }
    }

    /// Resolves the canonical startup file for `platform` in the user's home.
    pub fn for_platform(platform: Platform) -> Result<Self> {
        let home = BaseDirs::new()
            .map(|dirs| dirs.home_dir().to_path_buf())
            .ok_or(ProxyEnvError::HomeDirNotFound)?;
        let shell = std::env::var("SHELL").ok();

        Ok(Self::new(default_profile_path(platform, &home, shell.as_deref())))
    }

    /// Returns the file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<String> {
        match fs::read_to_string(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl ProxyEnvironment for ShellProfile {
    fn apply(&self, proxy_url: Option<&str>) -> Result<()> {
        let current = self.load()?;
        let updated = fence::replace_block(&current, proxy_url, &self.vars);

        if updated == current {
            debug!("{} already up to date", self.path.display());
            return Ok(());
        }

        write_atomic(&self.path, &updated)?;
        match proxy_url {
            Some(url) => info!("Wrote proxy block ({}) to {}", url, self.path.display()),
            None => info!("Removed proxy block from {}", self.path.display()),
        }
        Ok(())
    }

    fn read(&self) -> Result<EnvironmentProxyState> {
        Ok(fence::parse_block(&self.load()?, &self.vars))
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Picks the startup file: `~/.zshrc` on macOS and for zsh users on Linux,
/// `~/.bash_profile` otherwise.
pub fn default_profile_path(platform: Platform, home: &Path, shell: Option<&str>) -> PathBuf {
    let uses_zsh = shell.is_some_and(|s| s.contains("zsh"));
    let file = match platform {
        Platform::MacOs => ".zshrc",
        Platform::Linux if uses_zsh => ".zshrc",
        Platform::Linux | Platform::Windows => ".bash_profile",
    };
    home.join(file)
}

/// Replaces `path` with `content` via a sibling temp file and rename.
///
/// Symlinks are followed so the link itself survives. An existing file keeps
/// its permissions; a new one is created `0644` on unix.
fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let target = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let dir = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content.as_bytes())?;
    tmp.as_file().sync_all()?;

    match fs::metadata(&target) {
        Ok(meta) => fs::set_permissions(tmp.path(), meta.permissions())?,
        #[cfg(unix)]
        Err(_) => {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o644))?;
        }
        #[cfg(not(unix))]
        Err(_) => {}
    }

    tmp.persist(&target).map_err(|e| e.error)?;
    Ok(())
}

/// The environment writer of a platform, fixed at construction.
#[derive(Debug, Clone)]
pub enum EnvironmentTarget {
    /// Fenced block in a shell-startup file.
    ShellProfile(ShellProfile),
    /// Per-user environment store.
    UserEnvironment(UserEnvironment),
}

impl EnvironmentTarget {
    /// Selects the writer for the running OS.
    pub fn for_current_platform() -> Result<Self> {
        Self::for_platform(Platform::current()?)
    }

    /// Selects the writer for `platform`.
    pub fn for_platform(platform: Platform) -> Result<Self> {
        match platform {
            Platform::Windows => Ok(Self::UserEnvironment(UserEnvironment::new())),
            Platform::MacOs | Platform::Linux => {
                Ok(Self::ShellProfile(ShellProfile::for_platform(platform)?))
            }
        }
    }
}

impl ProxyEnvironment for EnvironmentTarget {
    fn apply(&self, proxy_url: Option<&str>) -> Result<()> {
        match self {
            Self::ShellProfile(profile) => profile.apply(proxy_url),
            Self::UserEnvironment(store) => store.apply(proxy_url),
        }
    }

    fn read(&self) -> Result<EnvironmentProxyState> {
        match self {
            Self::ShellProfile(profile) => profile.read(),
            Self::UserEnvironment(store) => store.read(),
        }
    }

    fn location(&self) -> String {
        match self {
            Self::ShellProfile(profile) => profile.location(),
            Self::UserEnvironment(store) => store.location(),
        }
    }
}
