use std::cell::Cell;
use std::ffi::{CString, OsStr};
use std::os::raw::{c_char, c_int, c_uint, c_void};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::bridge::{self, BridgeContext, InitializeEntryPoint, MessageEntryPoint};
use crate::coreclr::{CoreClrLoader, HostingFunctions, ManagedDelegate};
use crate::error::{HostError, Result};
use crate::platform::{Platform, PlatformLibraryLoader};

/// `E_POINTER`, reported when the runtime claims success but hands back no delegate.
const E_POINTER: i32 = 0x8000_4003_u32 as i32;

/// Lifecycle of a [`RuntimeHost`]. Transitions only ever move forward.
///
/// `Failed` is terminal: any fatal error during bootstrap lands there, and the only
/// call still accepted afterwards is `shutdown` of a runtime that did start.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum HostState {
    Unloaded,
    Loaded,
    Initialized,
    DelegatesResolved,
    Running,
    ShutDown,
    Failed,
}

/// Opaque runtime instance handle returned by `coreclr_initialize`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HostHandle(*mut c_void);

impl HostHandle {
    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }
}

/// Identifier of the single app domain created by `coreclr_initialize`.
pub type DomainId = u32;

/// Owns one hosted runtime from library load to shutdown.
///
/// Delegates resolved through the host borrow it, and [`RuntimeHost::shutdown`] needs
/// `&mut self`, so no delegate can be called after the runtime is gone.
pub struct RuntimeHost {
    base_dir: PathBuf,
    loader: Box<dyn PlatformLibraryLoader>,
    functions: Option<HostingFunctions>,
    instance: Option<(HostHandle, DomainId)>,
    state: Cell<HostState>,
    // Runtime call that timed out and may still be executing on its worker.
    abandoned: Cell<Option<&'static str>>,
    bridge: Arc<BridgeContext>,
    call_timeout: Option<Duration>,
}

impl RuntimeHost {
    pub fn new<L>(
        base_dir: impl Into<PathBuf>,
        loader: L,
        bridge: Arc<BridgeContext>,
    ) -> RuntimeHost
    where
        L: PlatformLibraryLoader + 'static,
    {
        RuntimeHost {
            base_dir: base_dir.into(),
            loader: Box::new(loader),
            functions: None,
            instance: None,
            state: Cell::new(HostState::Unloaded),
            abandoned: Cell::new(None),
            bridge,
            call_timeout: None,
        }
    }

    /// Host that loads the platform's `coreclr` library from `base_dir`.
    pub fn coreclr(
        base_dir: impl Into<PathBuf>,
        platform: Platform,
        bridge: Arc<BridgeContext>,
    ) -> RuntimeHost {
        RuntimeHost::new(base_dir, CoreClrLoader::new(platform), bridge)
    }

    /// Bounds how long `initialize` and `resolve_delegate` may block.
    ///
    /// A call that overruns is abandoned on its worker thread, not cancelled. The host
    /// then fails, keeps the runtime library mapped for the worker and never calls
    /// `coreclr_shutdown` underneath it.
    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> RuntimeHost {
        self.call_timeout = timeout;
        self
    }

    pub fn state(&self) -> HostState {
        self.state.get()
    }

    pub fn handle(&self) -> Option<HostHandle> {
        self.instance.map(|(handle, _)| handle)
    }

    pub fn domain_id(&self) -> Option<DomainId> {
        self.instance.map(|(_, domain)| domain)
    }

    pub fn bridge(&self) -> &Arc<BridgeContext> {
        &self.bridge
    }

    pub fn load(&mut self) -> Result<()> {
        self.expect_state("load", &[HostState::Unloaded])?;
        let functions = self.loader.load(&self.base_dir).map_err(|e| self.fail(e))?;
        self.functions = Some(functions);
        self.state.set(HostState::Loaded);
        Ok(())
    }

    /// Starts the runtime. `properties` are passed in the given order.
    pub fn initialize<K, V>(
        &mut self,
        base_path: &Path,
        domain_name: &str,
        properties: &[(K, V)],
    ) -> Result<(HostHandle, DomainId)>
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        self.expect_state("initialize", &[HostState::Loaded])?;
        let (handle, domain_id) = self
            .start_runtime(base_path, domain_name, properties)
            .map_err(|e| self.fail(e))?;

        self.instance = Some((handle, domain_id));
        self.state.set(HostState::Initialized);
        info!(domain_id, "runtime initialized");
        Ok((handle, domain_id))
    }

    fn start_runtime<K, V>(
        &self,
        base_path: &Path,
        domain_name: &str,
        properties: &[(K, V)],
    ) -> Result<(HostHandle, DomainId)>
    where
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        let functions = self.functions()?;
        let initialize = functions.initialize;
        let library = functions.library().cloned();

        let exe_path = runtime_string(base_path.as_os_str())?;
        let domain = CString::new(domain_name)?;
        let mut keys = Vec::with_capacity(properties.len());
        let mut values = Vec::with_capacity(properties.len());
        for (key, value) in properties {
            keys.push(runtime_string(key.as_ref())?);
            values.push(runtime_string(value.as_ref())?);
        }
        debug!(domain = domain_name, properties = keys.len(), "calling coreclr_initialize");

        let call = move || {
            let _library = library;
            let key_ptrs: Vec<*const c_char> = keys.iter().map(|k| k.as_ptr()).collect();
            let value_ptrs: Vec<*const c_char> = values.iter().map(|v| v.as_ptr()).collect();
            let mut host_handle = ptr::null_mut();
            let mut domain_id: c_uint = 0;
            let status = unsafe {
                initialize(
                    exe_path.as_ptr(),
                    domain.as_ptr(),
                    key_ptrs.len() as c_int,
                    key_ptrs.as_ptr(),
                    value_ptrs.as_ptr(),
                    &mut host_handle,
                    &mut domain_id,
                )
            };
            (status, host_handle as usize, domain_id)
        };
        let (status, host_handle, domain_id) =
            bounded(self.call_timeout, "coreclr_initialize", call)?;

        if status < 0 {
            error!(status, "coreclr_initialize failed");
            return Err(HostError::Initialization { status });
        }
        Ok((HostHandle(host_handle as *mut c_void), domain_id))
    }

    /// Binds a managed static method to a native function pointer of type `T`.
    ///
    /// `T` has to be pointer sized, otherwise [`HostError::DelegateType`] is returned
    /// before the runtime is asked for anything.
    pub fn resolve_delegate<T>(
        &self,
        assembly_name: &str,
        type_name: &str,
        method_name: &str,
    ) -> Result<ManagedDelegate<'_, T>> {
        self.expect_state(
            "resolve_delegate",
            &[HostState::Initialized, HostState::DelegatesResolved, HostState::Running],
        )?;
        let delegate = self
            .create_delegate::<T>(assembly_name, type_name, method_name)
            .map_err(|e| self.fail(e))?;

        if self.state() == HostState::Initialized {
            self.state.set(HostState::DelegatesResolved);
        }
        debug!(type_name, method_name, "delegate resolved");
        Ok(ManagedDelegate::new(delegate))
    }

    fn create_delegate<T>(
        &self,
        assembly_name: &str,
        type_name: &str,
        method_name: &str,
    ) -> Result<*mut c_void> {
        ManagedDelegate::<T>::check_layout()?;
        let functions = self.functions()?;
        let create_delegate = functions.create_delegate;
        let library = functions.library().cloned();
        let (handle, domain_id) = self.instance()?;

        let assembly = CString::new(assembly_name)?;
        let type_ = CString::new(type_name)?;
        let method = CString::new(method_name)?;
        let host_handle = handle.as_ptr() as usize;

        let call = move || {
            let _library = library;
            let mut delegate = ptr::null_mut();
            let status = unsafe {
                create_delegate(
                    host_handle as *mut c_void,
                    domain_id,
                    assembly.as_ptr(),
                    type_.as_ptr(),
                    method.as_ptr(),
                    &mut delegate,
                )
            };
            (status, delegate as usize)
        };
        let (status, delegate) = bounded(self.call_timeout, "coreclr_create_delegate", call)?;

        let status = if status >= 0 && delegate == 0 { E_POINTER } else { status };
        if status < 0 {
            warn!(assembly_name, type_name, method_name, status, "coreclr_create_delegate failed");
            return Err(HostError::DelegateResolution {
                assembly: assembly_name.to_string(),
                type_name: type_name.to_string(),
                method: method_name.to_string(),
                status,
            });
        }
        Ok(delegate as *mut c_void)
    }

    /// Publishes the delegate the bridge calls once managed initialization succeeds.
    /// Has to happen before [`RuntimeHost::invoke`], which is what can trigger it.
    pub fn arm_message_stage(
        &self,
        delegate: &ManagedDelegate<'_, MessageEntryPoint>,
    ) -> Result<()> {
        self.expect_state("arm_message_stage", &[HostState::DelegatesResolved])?;
        if !self.bridge.arm_message_stage(**delegate) {
            warn!("message stage already armed, keeping the first delegate");
        }
        Ok(())
    }

    /// Calls the first-stage delegate with the bridge's initialization callback.
    ///
    /// The managed side may call back before or after this returns, and on any thread.
    pub fn invoke(&self, delegate: &ManagedDelegate<'_, InitializeEntryPoint>) -> Result<()> {
        self.expect_state("invoke", &[HostState::DelegatesResolved])?;
        bridge::install(&self.bridge).map_err(|e| self.fail(e))?;
        self.state.set(HostState::Running);
        info!("invoking managed entry point");
        unsafe { (**delegate)(bridge::on_initialize_complete) };
        Ok(())
    }

    /// Stops the runtime. The handle is discarded even when the runtime reports a
    /// failure; that failure comes back as [`HostError::Shutdown`].
    ///
    /// A host that failed after initialization can still be shut down, unless a runtime
    /// call was abandoned on timeout and may still be running.
    pub fn shutdown(&mut self) -> Result<()> {
        let failed_after_start = self.state() == HostState::Failed
            && self.instance.is_some()
            && self.abandoned.get().is_none();
        if !failed_after_start {
            self.expect_state(
                "shutdown",
                &[HostState::Initialized, HostState::DelegatesResolved, HostState::Running],
            )?;
        }
        bridge::uninstall(&self.bridge);
        let shutdown = self.functions()?.shutdown;
        let (handle, domain_id) = self.instance()?;

        self.instance = None;
        if self.state() != HostState::Failed {
            self.state.set(HostState::ShutDown);
        }
        let status = unsafe { shutdown(handle.as_ptr(), domain_id) };
        if status < 0 {
            warn!(status, "coreclr_shutdown failed");
            return Err(HostError::Shutdown { status });
        }
        info!(domain_id, "runtime shut down");
        Ok(())
    }

    /// Moves the host to `Failed`. Wrong-state calls do not count as failures.
    fn fail(&self, err: HostError) -> HostError {
        if matches!(err, HostError::InvalidState { .. }) {
            return err;
        }
        if let HostError::Timeout { operation, .. } = err {
            self.abandoned.set(Some(operation));
        }
        self.state.set(HostState::Failed);
        err
    }

    fn expect_state(&self, operation: &'static str, allowed: &[HostState]) -> Result<()> {
        let state = self.state();
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(HostError::InvalidState { operation, state })
        }
    }

    fn functions(&self) -> Result<&HostingFunctions> {
        self.functions.as_ref().ok_or(HostError::InvalidState {
            operation: "use hosting functions",
            state: self.state(),
        })
    }

    fn instance(&self) -> Result<(HostHandle, DomainId)> {
        self.instance.ok_or(HostError::InvalidState {
            operation: "use runtime handle",
            state: self.state(),
        })
    }
}

impl Drop for RuntimeHost {
    fn drop(&mut self) {
        // A runtime that was started is always stopped, even when bootstrap bailed out
        // half way. Nothing can be propagated from here, so failures are only logged.
        if self.instance.is_none() {
            return;
        }
        if let Some(operation) = self.abandoned.get() {
            warn!(operation, "runtime call still in flight, leaving the runtime running");
            return;
        }
        if let Err(err) = self.shutdown() {
            error!(error = %err, "shutdown during drop failed");
        }
    }
}

/// Converts an OS string to what the runtime reads: raw bytes on Unix, UTF-8 elsewhere.
fn runtime_string(value: &OsStr) -> Result<CString> {
    if cfg!(unix) || value.to_str().is_some() {
        Ok(CString::new(value.as_encoded_bytes())?)
    } else {
        Err(HostError::NonUnicode {
            value: value.to_owned(),
        })
    }
}

/// Runs `call` inline, or on a worker thread when a timeout is configured.
fn bounded<R, F>(timeout: Option<Duration>, operation: &'static str, call: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let Some(after) = timeout else {
        return Ok(call());
    };
    let (tx, rx) = crossbeam_channel::bounded(1);
    thread::Builder::new()
        .name(format!("clrhost-{}", operation))
        .spawn(move || {
            let _ = tx.send(call());
        })
        .map_err(|source| HostError::Spawn { operation, source })?;
    rx.recv_timeout(after).map_err(|_| {
        error!(operation, ?after, "runtime call timed out");
        HostError::Timeout { operation, after }
    })
}
