use libloading as lib;

use std::any;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::Deref;
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{HostError, Result};
use crate::platform::{Platform, PlatformLibraryLoader};

pub type CoreCLRInitialize = unsafe extern "C" fn(
    *const c_char,
    *const c_char,
    c_int,
    *const *const c_char,
    *const *const c_char,
    *mut *mut c_void,
    *mut c_uint,
) -> c_int;
pub type CoreCLRCreateDelegate = unsafe extern "C" fn(
    *mut c_void,
    c_uint,
    *const c_char,
    *const c_char,
    *const c_char,
    *mut *mut c_void,
) -> c_int;
pub type CoreCLRShutdown = unsafe extern "C" fn(*mut c_void, c_uint) -> c_int;

const INITIALIZE_SYMBOL: &str = "coreclr_initialize";
const CREATE_DELEGATE_SYMBOL: &str = "coreclr_create_delegate";
const SHUTDOWN_SYMBOL: &str = "coreclr_shutdown";

/// A managed method exposed as a native function pointer of type `T`.
///
/// Borrows the host that produced it, so it cannot be called once the runtime has been
/// shut down.
pub struct ManagedDelegate<'clr, T: 'clr> {
    managed_pointer: *mut c_void,
    phantom: PhantomData<&'clr T>,
}

impl<'clr, T> ManagedDelegate<'clr, T> {
    /// Rejects delegate types that cannot hold a native function pointer.
    pub(crate) fn check_layout() -> Result<()> {
        if mem::size_of::<T>() == mem::size_of::<*mut c_void>() {
            Ok(())
        } else {
            Err(HostError::DelegateType {
                type_name: any::type_name::<T>(),
            })
        }
    }

    /// Callers must have passed [`ManagedDelegate::check_layout`] for `T`.
    pub(crate) fn new(managed_pointer: *mut c_void) -> ManagedDelegate<'clr, T> {
        debug_assert!(Self::check_layout().is_ok());
        ManagedDelegate {
            managed_pointer,
            phantom: PhantomData,
        }
    }

    pub fn as_ptr(&self) -> *mut c_void {
        self.managed_pointer
    }
}

impl<'clr, T> fmt::Debug for ManagedDelegate<'clr, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedDelegate")
            .field("managed_pointer", &self.managed_pointer)
            .field("type", &any::type_name::<T>())
            .finish()
    }
}

impl<'clr, T> Deref for ManagedDelegate<'clr, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*(&self.managed_pointer as *const *mut c_void as *const T) }
    }
}

/// The three CoreCLR hosting entry points, resolved and ready to call.
///
/// When the pointers came out of a shared library the library handle is kept here too,
/// so the code they point at stays mapped for as long as this value, or any call still
/// holding [`HostingFunctions::library`], lives.
#[derive(Debug)]
pub struct HostingFunctions {
    pub(crate) initialize: CoreCLRInitialize,
    pub(crate) create_delegate: CoreCLRCreateDelegate,
    pub(crate) shutdown: CoreCLRShutdown,
    library: Option<Arc<lib::Library>>,
}

impl HostingFunctions {
    /// Wraps entry points that are already part of the process, e.g. a statically
    /// linked runtime.
    pub fn from_raw(
        initialize: CoreCLRInitialize,
        create_delegate: CoreCLRCreateDelegate,
        shutdown: CoreCLRShutdown,
    ) -> HostingFunctions {
        HostingFunctions {
            initialize,
            create_delegate,
            shutdown,
            library: None,
        }
    }

    /// Ties the entry points to `library`, which then stays open as long as they do.
    pub fn with_library(mut self, library: lib::Library) -> HostingFunctions {
        self.library = Some(Arc::new(library));
        self
    }

    pub fn is_library_backed(&self) -> bool {
        self.library.is_some()
    }

    pub(crate) fn library(&self) -> Option<&Arc<lib::Library>> {
        self.library.as_ref()
    }
}

/// Loads `coreclr` from disk with `libloading`.
#[derive(Clone, Copy, Debug)]
pub struct CoreClrLoader {
    platform: Platform,
}

impl CoreClrLoader {
    pub fn new(platform: Platform) -> CoreClrLoader {
        CoreClrLoader { platform }
    }

    pub fn library_path(&self, base_dir: &Path) -> PathBuf {
        base_dir.join(self.platform.runtime_library_name())
    }

    /// Opens the library at `path` and resolves all three hosting functions.
    /// A missing symbol is fatal; there is nothing to fall back to.
    pub fn load_file(&self, path: &Path) -> Result<HostingFunctions> {
        debug!(path = %path.display(), "opening runtime library");
        let library = unsafe { lib::Library::new(path) }.map_err(|source| HostError::Load {
            path: path.to_path_buf(),
            source,
        })?;

        let (initialize, create_delegate, shutdown) = unsafe {
            (
                resolve::<CoreCLRInitialize>(&library, path, INITIALIZE_SYMBOL)?,
                resolve::<CoreCLRCreateDelegate>(&library, path, CREATE_DELEGATE_SYMBOL)?,
                resolve::<CoreCLRShutdown>(&library, path, SHUTDOWN_SYMBOL)?,
            )
        };
        info!(path = %path.display(), "runtime library loaded");

        Ok(HostingFunctions {
            initialize,
            create_delegate,
            shutdown,
            library: Some(Arc::new(library)),
        })
    }
}

impl PlatformLibraryLoader for CoreClrLoader {
    fn load(&self, base_dir: &Path) -> Result<HostingFunctions> {
        self.load_file(&self.library_path(base_dir))
    }
}

unsafe fn resolve<T: Copy>(
    library: &lib::Library,
    path: &Path,
    symbol: &'static str,
) -> Result<T> {
    let func: lib::Symbol<T> = library
        .get(symbol.as_bytes())
        .map_err(|source| HostError::SymbolResolution {
            path: path.to_path_buf(),
            symbol,
            source,
        })?;
    Ok(*func)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_library_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let loader = CoreClrLoader::new(Platform::current());
        match loader.load(dir.path()) {
            Err(HostError::Load { path, .. }) => {
                assert_eq!(path, loader.library_path(dir.path()))
            }
            other => panic!("expected a load error, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[test]
    fn library_path_uses_platform_name() {
        let loader = CoreClrLoader::new(Platform::Linux);
        assert_eq!(
            loader.library_path(Path::new("/opt/dotnet")),
            PathBuf::from("/opt/dotnet/libcoreclr.so")
        );
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    #[test]
    fn library_without_hosting_exports_is_a_symbol_error() {
        let loader = CoreClrLoader::new(Platform::Linux);
        match loader.load_file(Path::new("libc.so.6")) {
            Err(HostError::SymbolResolution { symbol, .. }) => {
                assert_eq!(symbol, INITIALIZE_SYMBOL)
            }
            other => panic!("expected a symbol error, got {:?}", other),
        }
    }

    #[test]
    fn delegate_derefs_to_the_function_pointer() {
        extern "C" fn seven() -> i32 {
            7
        }
        let delegate: ManagedDelegate<extern "C" fn() -> i32> =
            ManagedDelegate::new(seven as *mut c_void);
        assert_eq!((*delegate)(), 7);
        assert!(format!("{:?}", delegate).starts_with("ManagedDelegate"));
    }

    #[test]
    fn delegate_types_must_be_pointer_sized() {
        assert!(ManagedDelegate::<extern "C" fn()>::check_layout().is_ok());
        match ManagedDelegate::<[u64; 4]>::check_layout() {
            Err(HostError::DelegateType { type_name }) => assert!(type_name.contains("u64")),
            other => panic!("expected a delegate type error, got {:?}", other),
        }
    }
}
