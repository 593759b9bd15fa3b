//! Host platform detection and binary naming.

use std::fmt;

/// Platforms a staged tor binary can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    /// 32-bit Linux.
    Linux32,
    /// 64-bit Linux.
    Linux64,
    /// macOS.
    MacOs,
    /// Windows.
    Windows,
    /// Any other unix (BSDs and friends).
    OtherUnix,
}

impl Platform {
    /// Detect the platform this process runs on.
    pub fn detect() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "linux") {
            if cfg!(target_pointer_width = "64") {
                Platform::Linux64
            } else {
                Platform::Linux32
            }
        } else {
            Platform::OtherUnix
        }
    }

    /// File name of the tor executable.
    pub const fn binary_name(self) -> &'static str {
        match self {
            Platform::Windows => "tor.exe",
            _ => "tor",
        }
    }

    /// Whether this is a Linux target.
    pub const fn is_linux(self) -> bool {
        matches!(self, Platform::Linux32 | Platform::Linux64)
    }

    /// Staged Linux binaries ship their own shared libraries next to the
    /// executable.
    pub const fn sets_library_path(self) -> bool {
        self.is_linux()
    }

    /// Whether tor forks into the background (`RunAsDaemon 1`) so the
    /// launcher process exits once the daemon is up.
    pub const fn daemonizes(self) -> bool {
        !matches!(self, Platform::Windows)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Platform::Linux32 => "linux32",
            Platform::Linux64 => "linux64",
            Platform::MacOs => "macos",
            Platform::Windows => "windows",
            Platform::OtherUnix => "unix",
        };
        f.write_str(name)
    }
}

/// Any execute bit (owner, group or other) set.
pub const fn is_executable_mode(mode: u32) -> bool {
    mode & 0o111 != 0
}

/// Execute permission granted to the owner only.
pub const fn is_owner_only_executable(mode: u32) -> bool {
    mode & 0o100 != 0 && mode & 0o011 == 0
}
