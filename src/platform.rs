//! Per-platform conventions and the two capabilities the host needs from the OS:
//! opening the runtime library and listing the assembly directory.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;

use crate::coreclr::HostingFunctions;
use crate::error::Result;

/// Platform family the host is running on.
///
/// Selected once at startup with [`Platform::current`]; everything that differs between
/// Windows and POSIX hosts hangs off this value instead of `#[cfg]` blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
}

impl Platform {
    pub fn current() -> Platform {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else {
            Platform::Linux
        }
    }

    /// File name of the CoreCLR shared library for this platform.
    pub fn runtime_library_name(self) -> &'static str {
        match self {
            Platform::Windows => "coreclr.dll",
            Platform::MacOs => "libcoreclr.dylib",
            Platform::Linux => "libcoreclr.so",
        }
    }

    pub fn path_separator(self) -> char {
        match self {
            Platform::Windows => '\\',
            Platform::MacOs | Platform::Linux => '/',
        }
    }

    /// Separator between entries of path-list runtime properties.
    pub fn list_delimiter(self) -> char {
        match self {
            Platform::Windows => ';',
            Platform::MacOs | Platform::Linux => ':',
        }
    }
}

/// Opens the runtime library found in `base_dir` and resolves its hosting entry points.
pub trait PlatformLibraryLoader {
    fn load(&self, base_dir: &Path) -> Result<HostingFunctions>;
}

/// Lists the regular files directly inside a directory.
///
/// Implementations must not recurse and make no promise about ordering.
pub trait PlatformDirectoryScanner {
    fn list_files(&self, dir: &Path) -> io::Result<Vec<OsString>>;
}

/// Directory scanner backed by `std::fs::read_dir`.
#[derive(Clone, Copy, Debug, Default)]
pub struct FsDirectoryScanner;

impl PlatformDirectoryScanner for FsDirectoryScanner {
    fn list_files(&self, dir: &Path) -> io::Result<Vec<OsString>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            // Follows symlinks, so a linked assembly counts as a file.
            if fs::metadata(entry.path()).map(|m| m.is_dir()).unwrap_or(false) {
                continue;
            }
            names.push(entry.file_name());
        }
        Ok(names)
    }
}
