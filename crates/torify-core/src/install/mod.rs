//! Staging tor into its data directory.
//!
//! The supervisor only needs three things from an installation: a binary to
//! launch, a torrc to point it at, and a version marker that says the first
//! two are complete. [`Installer`] is the seam; [`FileInstaller`] is the
//! default implementation, which copies a tor binary from a [`BinarySource`]
//! and writes a torrc tailored for a controller-owned daemon.

mod platform;

pub use platform::{is_executable_mode, is_owner_only_executable, Platform};

use crate::error::{Error, Result};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Hidden directory holding the control auth cookie.
pub const DOT_TOR_DIR: &str = ".tor";
/// Control auth cookie file name.
pub const COOKIE_FILE: &str = "control_auth_cookie";
/// Version marker file name.
pub const VERSION_FILE: &str = "version";
/// Owner pid file name.
pub const PID_FILE: &str = "pid";
/// Generated torrc file name.
pub const TORRC_FILE: &str = "torrc";
/// Default onion service directory name.
pub const DEFAULT_HS_DIR: &str = "hiddenservice";

/// File locations inside a tor data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorLayout {
    tor_dir: PathBuf,
}

impl TorLayout {
    /// Layout rooted at `tor_dir`.
    pub fn new(tor_dir: impl Into<PathBuf>) -> Self {
        Self {
            tor_dir: tor_dir.into(),
        }
    }

    /// The data directory itself.
    pub fn tor_dir(&self) -> &Path {
        &self.tor_dir
    }

    /// Directory holding the cookie file.
    pub fn dot_tor_dir(&self) -> PathBuf {
        self.tor_dir.join(DOT_TOR_DIR)
    }

    /// Control auth cookie.
    pub fn cookie_file(&self) -> PathBuf {
        self.dot_tor_dir().join(COOKIE_FILE)
    }

    /// Version marker.
    pub fn version_file(&self) -> PathBuf {
        self.tor_dir.join(VERSION_FILE)
    }

    /// Owner pid file.
    pub fn pid_file(&self) -> PathBuf {
        self.tor_dir.join(PID_FILE)
    }

    /// Generated torrc.
    pub fn torrc_file(&self) -> PathBuf {
        self.tor_dir.join(TORRC_FILE)
    }

    /// Staged tor executable.
    pub fn binary(&self, platform: Platform) -> PathBuf {
        self.tor_dir.join(platform.binary_name())
    }

    /// Directory for an onion service's hostname and key files.
    pub fn hidden_service_dir(&self, name: &str) -> PathBuf {
        self.tor_dir.join(name)
    }
}

/// Prepares a data directory so tor can be launched from it.
pub trait Installer: Send + Sync + 'static {
    /// File locations this installer manages.
    fn layout(&self) -> &TorLayout;

    /// Platform the staged binary targets.
    fn platform(&self) -> Platform;

    /// Install files unless the version marker says they are current.
    ///
    /// Returns `true` when an install took place. A failed install must leave
    /// no version marker behind.
    fn install_if_needed(&self) -> Result<bool>;

    /// Delete the version marker so the next start reinstalls.
    fn invalidate(&self) -> Result<()> {
        remove_if_exists(&self.layout().version_file())
    }

    /// Delete a cookie left over from a previous run.
    fn cleanup_cookie(&self) -> Result<()> {
        remove_if_exists(&self.layout().cookie_file())
    }
}

/// Where the tor executable comes from.
pub trait BinarySource: Send + Sync + 'static {
    /// Place the tor executable (and anything it ships with) in `target_dir`.
    fn extract_binary(&self, target_dir: &Path, platform: Platform) -> Result<()>;
}

/// A tor binary already present on this host.
#[derive(Debug, Clone)]
pub struct LocalBinary {
    path: PathBuf,
}

impl LocalBinary {
    /// Use the binary at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Search `PATH` for the platform's tor executable.
    pub fn find_on_path(platform: Platform) -> Option<Self> {
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(platform.binary_name()))
            .find(|candidate| candidate.is_file())
            .map(Self::new)
    }

    /// Source path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BinarySource for LocalBinary {
    fn extract_binary(&self, target_dir: &Path, platform: Platform) -> Result<()> {
        let target = target_dir.join(platform.binary_name());

        // Unlink first: a daemon from a previous run may still be executing
        // the old copy.
        remove_if_exists(&target)?;
        fs::copy(&self.path, &target).map_err(|e| {
            Error::Install(format!("failed to copy {}: {}", self.path.display(), e))
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            let mode = fs::metadata(&self.path)
                .map_err(|e| Error::persistence(&self.path, e))?
                .permissions()
                .mode();
            if !is_executable_mode(mode) {
                return Err(Error::Install(format!(
                    "{} is not executable",
                    self.path.display()
                )));
            }
            let staged_mode = if is_owner_only_executable(mode) { 0o700 } else { 0o755 };
            fs::set_permissions(&target, fs::Permissions::from_mode(staged_mode))
                .map_err(|e| Error::persistence(&target, e))?;
        }

        tracing::debug!(source = %self.path.display(), target = %target.display(), "Staged tor binary");
        Ok(())
    }
}

/// Default installer: stage a binary, write torrc, write the version marker.
pub struct FileInstaller {
    layout: TorLayout,
    platform: Platform,
    source: Arc<dyn BinarySource>,
    bridges: Vec<String>,
}

impl FileInstaller {
    /// Installer for `layout` staging binaries from `source`.
    pub fn new(layout: TorLayout, source: Arc<dyn BinarySource>) -> Self {
        Self {
            layout,
            platform: Platform::detect(),
            source,
            bridges: Vec::new(),
        }
    }

    /// Configure bridges written into torrc.
    pub fn with_bridges(mut self, bridges: Vec<String>) -> Self {
        self.bridges = bridges;
        self
    }

    /// Target a specific platform instead of the host.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Whether the version marker matches this build.
    pub fn is_up_to_date(&self) -> bool {
        match fs::read_to_string(self.layout.version_file()) {
            Ok(version) => version.trim() == crate::VERSION,
            Err(_) => false,
        }
    }

    fn install_files(&self) -> Result<()> {
        make_dirs(self.layout.tor_dir())?;
        make_dirs(&self.layout.dot_tor_dir())?;

        self.source.extract_binary(self.layout.tor_dir(), self.platform)?;
        self.write_torrc()?;

        // Written last: its presence means everything above completed.
        let version_file = self.layout.version_file();
        fs::write(&version_file, crate::VERSION)
            .map_err(|e| Error::persistence(&version_file, e))?;

        tracing::info!(tor_dir = %self.layout.tor_dir().display(), "Tor files installed");
        Ok(())
    }

    /// Regenerate torrc; bridges may have changed since the last start.
    fn write_torrc(&self) -> Result<()> {
        let torrc = self.layout.torrc_file();
        fs::write(&torrc, self.torrc_contents()).map_err(|e| Error::persistence(&torrc, e))
    }

    /// Torrc for a daemon that is owned by its controller.
    pub fn torrc_contents(&self) -> String {
        let mut lines = vec![
            "# Generated by torify. Rewritten on every start.".to_string(),
            format!("DataDirectory {}", quote_path(self.layout.tor_dir())),
            "CookieAuthentication 1".to_string(),
            format!("CookieAuthFile {}", quote_path(&self.layout.cookie_file())),
            format!("PidFile {}", quote_path(&self.layout.pid_file())),
            "SocksPort auto".to_string(),
            "ControlPort auto".to_string(),
            "AvoidDiskWrites 1".to_string(),
            "DisableNetwork 1".to_string(),
            "Log notice stdout".to_string(),
        ];
        if self.platform.daemonizes() {
            lines.push("RunAsDaemon 1".to_string());
        }
        if !self.bridges.is_empty() {
            lines.push(String::new());
            lines.push("UseBridges 1".to_string());
            lines.extend(self.bridges.iter().map(|bridge| format!("Bridge {}", bridge)));
        }
        lines.push(String::new());
        lines.join("\n")
    }
}

impl Installer for FileInstaller {
    fn layout(&self) -> &TorLayout {
        &self.layout
    }

    fn platform(&self) -> Platform {
        self.platform
    }

    fn install_if_needed(&self) -> Result<bool> {
        let result = if self.is_up_to_date() {
            self.write_torrc().map(|()| false)
        } else {
            self.install_files().map(|()| true)
        };

        if let Err(e) = &result {
            tracing::warn!(error = %e, "Install failed, removing version marker");
            if let Err(e) = self.invalidate() {
                tracing::error!(error = %e, "Failed to remove version marker");
            }
        }
        result
    }
}

/// Torrc values are quoted so paths with spaces survive.
fn quote_path(path: &Path) -> String {
    let escaped = path
        .display()
        .to_string()
        .replace('\\', "\\\\")
        .replace('"', "\\\"");
    format!("\"{}\"", escaped)
}

fn make_dirs(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|e| Error::persistence(dir, e))
}

/// Remove a file, treating a missing file as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::persistence(path, e)),
    }
}
