//! The end-to-end hello-world sequence: build the TPA list, load and start the runtime,
//! resolve both managed entry points, run them, wait, shut down.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};

use crate::bridge::{BridgeContext, InitializeEntryPoint, MessageEntryPoint};
use crate::config::HostConfig;
use crate::error::{HostError, Result};
use crate::host::RuntimeHost;
use crate::output::OutputSink;
use crate::platform::{Platform, PlatformLibraryLoader};
use crate::tpa::{AssemblyListBuilder, APP_PATHS, TRUSTED_PLATFORM_ASSEMBLIES};

/// Exit code for any fatal bootstrap failure.
pub const EXIT_FAILURE: i32 = -1;

/// What a completed run left behind. A failed shutdown does not make the run fail.
#[derive(Debug, Default)]
pub struct RunReport {
    pub trusted_assemblies: usize,
    pub shutdown_error: Option<HostError>,
}

pub struct Bootstrap {
    config: HostConfig,
    platform: Platform,
    sink: Arc<dyn OutputSink>,
}

impl Bootstrap {
    pub fn new(config: HostConfig, platform: Platform, sink: Arc<dyn OutputSink>) -> Bootstrap {
        Bootstrap { config, platform, sink }
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Runs the whole sequence. `wait` is called after the managed code has been
    /// started and before the runtime is shut down.
    ///
    /// Fatal errors are reported to the output sink before being returned.
    pub fn run<L, W>(&self, loader: L, wait: W) -> Result<RunReport>
    where
        L: PlatformLibraryLoader + 'static,
        W: FnOnce(),
    {
        self.run_stages(loader, wait).map_err(|err| {
            self.sink.line(&format!("Bootstrap failed: {}", err));
            err
        })
    }

    fn run_stages<L, W>(&self, loader: L, wait: W) -> Result<RunReport>
    where
        L: PlatformLibraryLoader + 'static,
        W: FnOnce(),
    {
        let config = &self.config;
        let runtime_dir = config.runtime_dir()?;

        let tpa = AssemblyListBuilder::new(self.platform)
            .scan_failure(config.scan_failure)
            .deduplicate(config.deduplicate)
            .build(&runtime_dir, &config.tpa_extension)?;
        self.sink.line(&format!(
            "Found {} trusted assemblies in {}",
            tpa.len(),
            runtime_dir.display()
        ));
        self.check_managed_assembly(&runtime_dir);

        let bridge = Arc::new(BridgeContext::new(
            Arc::clone(&self.sink),
            config.message_suffix.clone(),
        ));
        let mut host = RuntimeHost::new(&runtime_dir, loader, bridge)
            .with_call_timeout(config.call_timeout());

        host.load()?;
        self.sink.line("Runtime library loaded");

        let properties = [
            (TRUSTED_PLATFORM_ASSEMBLIES, tpa.to_property_value()),
            (APP_PATHS, runtime_dir.clone().into_os_string()),
        ];
        let (_, domain_id) = host.initialize(&runtime_dir, &config.app_domain, &properties)?;
        self.sink.line(&format!("Runtime started (domain {})", domain_id));

        {
            let start = host.resolve_delegate::<InitializeEntryPoint>(
                &config.assembly_name,
                &config.type_name,
                &config.initialize_method,
            )?;
            let message = host.resolve_delegate::<MessageEntryPoint>(
                &config.assembly_name,
                &config.type_name,
                &config.message_method,
            )?;
            self.sink.line("Managed delegates created");

            host.arm_message_stage(&message)?;
            host.invoke(&start)?;
            wait();
        }

        let shutdown_error = match host.shutdown() {
            Ok(()) => {
                self.sink.line("Runtime shut down");
                None
            }
            Err(err) => {
                self.sink.line(&format!("Shutdown reported an error: {}", err));
                Some(err)
            }
        };
        info!("bootstrap finished");

        Ok(RunReport {
            trusted_assemblies: tpa.len(),
            shutdown_error,
        })
    }

    fn check_managed_assembly(&self, runtime_dir: &Path) {
        let path = runtime_dir.join(&self.config.assembly_file);
        if !path.is_file() {
            warn!(
                path = %path.display(),
                "managed assembly not found, delegate creation will likely fail"
            );
        }
    }
}

/// Maps the outcome of [`Bootstrap::run`] to a process exit code.
pub fn exit_code(outcome: &Result<RunReport>) -> i32 {
    match outcome {
        Ok(_) => 0,
        Err(_) => EXIT_FAILURE,
    }
}
