//! Trusted platform assembly (TPA) list construction.

use std::collections::HashSet;
use std::ffi::{OsStr, OsString};
use std::path::{self, Path};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{HostError, Result};
use crate::platform::{FsDirectoryScanner, Platform, PlatformDirectoryScanner};

/// Runtime property holding the TPA list.
pub const TRUSTED_PLATFORM_ASSEMBLIES: &str = "TRUSTED_PLATFORM_ASSEMBLIES";
/// Runtime property naming the directories searched for application assemblies.
pub const APP_PATHS: &str = "APP_PATHS";

/// What to do when the assembly directory cannot be listed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScanFailurePolicy {
    /// Log and return an empty list.
    #[default]
    Silent,
    /// Fail with [`HostError::DirectoryAccess`].
    FailFast,
}

/// Paths the runtime may load as trusted, in scan order.
///
/// Entries are OS strings: a file name that is not valid Unicode is still a loadable
/// assembly and is passed to the runtime byte for byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssemblyList {
    entries: Vec<OsString>,
    delimiter: char,
}

impl AssemblyList {
    pub fn entries(&self) -> &[OsString] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Renders the list as the runtime expects it: every entry followed by the
    /// platform delimiter, including the last one.
    pub fn to_property_value(&self) -> OsString {
        let mut delimiter = [0; 4];
        let delimiter: &str = self.delimiter.encode_utf8(&mut delimiter);
        let mut value = OsString::with_capacity(self.entries.iter().map(|e| e.len() + 1).sum());
        for entry in &self.entries {
            value.push(entry);
            value.push(delimiter);
        }
        value
    }
}

/// Builds an [`AssemblyList`] from the files of a single directory.
///
/// Entries come out in whatever order the scanner yields them. Duplicate file names are
/// kept unless [`AssemblyListBuilder::deduplicate`] is turned on.
#[derive(Clone, Debug)]
pub struct AssemblyListBuilder<S = FsDirectoryScanner> {
    platform: Platform,
    scanner: S,
    scan_failure: ScanFailurePolicy,
    deduplicate: bool,
}

impl AssemblyListBuilder<FsDirectoryScanner> {
    pub fn new(platform: Platform) -> Self {
        AssemblyListBuilder::with_scanner(platform, FsDirectoryScanner)
    }
}

impl<S: PlatformDirectoryScanner> AssemblyListBuilder<S> {
    pub fn with_scanner(platform: Platform, scanner: S) -> Self {
        AssemblyListBuilder {
            platform,
            scanner,
            scan_failure: ScanFailurePolicy::default(),
            deduplicate: false,
        }
    }

    pub fn scan_failure(mut self, policy: ScanFailurePolicy) -> Self {
        self.scan_failure = policy;
        self
    }

    pub fn deduplicate(mut self, deduplicate: bool) -> Self {
        self.deduplicate = deduplicate;
        self
    }

    /// Lists `dir` and keeps every file whose name ends with `extension`
    /// (exact, case-sensitive suffix, compared on the raw name).
    pub fn build(&self, dir: &Path, extension: &str) -> Result<AssemblyList> {
        let empty = AssemblyList {
            entries: Vec::new(),
            delimiter: self.platform.list_delimiter(),
        };

        let listing =
            path::absolute(dir).and_then(|abs| Ok((self.scanner.list_files(&abs)?, abs)));
        let (names, abs_dir) = match listing {
            Ok(listing) => listing,
            Err(source) => {
                return match self.scan_failure {
                    ScanFailurePolicy::FailFast => Err(HostError::DirectoryAccess {
                        path: dir.to_path_buf(),
                        source,
                    }),
                    ScanFailurePolicy::Silent => {
                        warn!(
                            dir = %dir.display(),
                            error = %source,
                            "assembly directory unreadable, using an empty TPA list"
                        );
                        Ok(empty)
                    }
                };
            }
        };

        let mut separator = [0; 4];
        let separator: &str = self.platform.path_separator().encode_utf8(&mut separator);
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        for name in names {
            if !has_suffix(&name, extension) {
                continue;
            }
            if self.deduplicate && !seen.insert(name.clone()) {
                debug!(?name, "skipping duplicate assembly");
                continue;
            }
            let mut entry = abs_dir.clone().into_os_string();
            entry.push(separator);
            entry.push(&name);
            entries.push(entry);
        }
        debug!(dir = %abs_dir.display(), count = entries.len(), "built TPA list");

        Ok(AssemblyList { entries, ..empty })
    }
}

fn has_suffix(name: &OsStr, extension: &str) -> bool {
    name.as_encoded_bytes().ends_with(extension.as_bytes())
}
