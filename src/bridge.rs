//! Native callbacks handed to managed code.
//!
//! The managed entry points only accept bare function pointers, so the two callbacks
//! below cannot carry a context argument. Instead they look up the [`BridgeContext`] of
//! the host that is currently running. The context itself is owned by that host; the
//! process-wide slot only holds a reference to it while the host is running, which is
//! also what limits a process to one hosted runtime at a time.

use std::ffi::CStr;
use std::os::raw::c_char;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::{HostError, Result};
use crate::output::OutputSink;

/// Managed side reports whether it finished its own setup.
pub type InitializeCallback = extern "C" fn(bool);
/// Managed side delivers a NUL-terminated UTF-8 message.
pub type MessageCallback = extern "C" fn(*const c_char);

/// First-stage managed method: `void Initialize(Action<bool> callback)`.
pub type InitializeEntryPoint = unsafe extern "C" fn(InitializeCallback);
/// Second-stage managed method: `void SayHello(Action<string> callback)`.
pub type MessageEntryPoint = unsafe extern "C" fn(MessageCallback);

static ACTIVE: RwLock<Option<Arc<BridgeContext>>> = parking_lot::const_rwlock(None);

/// State the callbacks need, owned by a [`RuntimeHost`](crate::host::RuntimeHost).
pub struct BridgeContext {
    sink: Arc<dyn OutputSink>,
    suffix: String,
    message_stage: OnceLock<MessageEntryPoint>,
}

impl BridgeContext {
    pub fn new(sink: Arc<dyn OutputSink>, suffix: impl Into<String>) -> BridgeContext {
        BridgeContext {
            sink,
            suffix: suffix.into(),
            message_stage: OnceLock::new(),
        }
    }

    pub fn sink(&self) -> &Arc<dyn OutputSink> {
        &self.sink
    }

    /// Stores the second-stage entry point. Must happen before the first stage is
    /// invoked; only the first value stored is kept.
    pub fn arm_message_stage(&self, entry: MessageEntryPoint) -> bool {
        self.message_stage.set(entry).is_ok()
    }

    pub fn is_armed(&self) -> bool {
        self.message_stage.get().is_some()
    }

    pub fn initialize_complete(&self, success: bool) {
        if !success {
            self.sink.line("Managed library failed to initialize; connection failed");
            return;
        }
        match self.message_stage.get() {
            Some(entry) => {
                debug!("managed initialization succeeded, invoking message stage");
                unsafe { entry(on_message) };
            }
            None => {
                warn!("managed initialization succeeded but no message stage was armed");
                self.sink.line("Managed library initialized, but there is nothing to call next");
            }
        }
    }

    pub fn message(&self, text: &str) {
        self.sink.write(&format!("{} - {}\n", text, self.suffix));
    }
}

/// Makes `context` the target of the process-wide callbacks.
pub(crate) fn install(context: &Arc<BridgeContext>) -> Result<()> {
    let mut active = ACTIVE.write();
    match active.as_ref() {
        Some(current) if !Arc::ptr_eq(current, context) => Err(HostError::BridgeBusy),
        _ => {
            *active = Some(Arc::clone(context));
            Ok(())
        }
    }
}

/// Detaches `context` if it is the active one. Callbacks arriving afterwards are dropped.
pub(crate) fn uninstall(context: &Arc<BridgeContext>) {
    let mut active = ACTIVE.write();
    if active.as_ref().is_some_and(|current| Arc::ptr_eq(current, context)) {
        *active = None;
    }
}

fn active() -> Option<Arc<BridgeContext>> {
    ACTIVE.read().clone()
}

/// Passed to the first-stage managed method.
pub extern "C" fn on_initialize_complete(success: bool) {
    match active() {
        Some(context) => context.initialize_complete(success),
        None => warn!(success, "initialization callback arrived with no running host"),
    }
}

/// Passed to the second-stage managed method.
pub extern "C" fn on_message(text: *const c_char) {
    let Some(context) = active() else {
        warn!("message callback arrived with no running host");
        return;
    };
    match unsafe { c_str_lossy(text) } {
        Some(text) => context.message(&text),
        None => {
            warn!("managed code delivered a null message");
            context.message("");
        }
    }
}

/// Copies a NUL-terminated string handed over by the runtime.
///
/// # Safety
/// `ptr` must be null or point to a valid C string.
pub unsafe fn c_str_lossy(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        None
    } else {
        Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::MemorySink;
    use parking_lot::Mutex;

    // Tests that touch the process-wide slot must not overlap.
    static SLOT: Mutex<()> = parking_lot::const_mutex(());

    unsafe extern "C" fn say_hello(callback: MessageCallback) {
        callback(c"Hello from managed code".as_ptr());
    }

    fn context(sink: &Arc<MemorySink>) -> Arc<BridgeContext> {
        Arc::new(BridgeContext::new(sink.clone(), "from Rust"))
    }

    #[test]
    fn message_appends_native_suffix() {
        let sink = Arc::new(MemorySink::new());
        context(&sink).message("Hello");
        assert_eq!(sink.contents(), "Hello - from Rust\n");
    }

    #[test]
    fn failed_initialization_stops_there() {
        let sink = Arc::new(MemorySink::new());
        let ctx = context(&sink);
        assert!(ctx.arm_message_stage(say_hello));
        ctx.initialize_complete(false);
        assert_eq!(sink.writes().len(), 1);
        assert!(sink.contents().contains("failed"));
    }

    #[test]
    fn arming_twice_keeps_the_first_entry() {
        let sink = Arc::new(MemorySink::new());
        let ctx = context(&sink);
        assert!(!ctx.is_armed());
        assert!(ctx.arm_message_stage(say_hello));
        assert!(!ctx.arm_message_stage(say_hello));
        assert!(ctx.is_armed());
    }

    #[test]
    fn successful_initialization_runs_message_stage() {
        let _slot = SLOT.lock();
        let sink = Arc::new(MemorySink::new());
        let ctx = context(&sink);
        ctx.arm_message_stage(say_hello);
        install(&ctx).unwrap();

        on_initialize_complete(true);
        uninstall(&ctx);

        assert_eq!(sink.writes(), vec!["Hello from managed code - from Rust\n".to_string()]);
    }

    #[test]
    fn second_host_cannot_take_the_bridge() {
        let _slot = SLOT.lock();
        let first = context(&Arc::new(MemorySink::new()));
        let second = context(&Arc::new(MemorySink::new()));

        install(&first).unwrap();
        assert!(matches!(install(&second), Err(HostError::BridgeBusy)));
        install(&first).unwrap();

        uninstall(&second);
        assert!(active().is_some());
        uninstall(&first);
        assert!(active().is_none());
    }

    #[test]
    fn callbacks_without_a_host_are_dropped() {
        let _slot = SLOT.lock();
        on_initialize_complete(true);
        on_message(c"ignored".as_ptr());
    }
}
