use std::io::{self, BufRead};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use rustclr::bootstrap::{self, Bootstrap};
use rustclr::output::{OutputSink, StdoutSink};
use rustclr::tpa::ScanFailurePolicy;
use rustclr::{CoreClrLoader, HostConfig, Platform};

/// Starts CoreCLR in-process and runs the managed hello-world entry points.
#[derive(Parser)]
#[command(name = "rustclr-host", version, about)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory containing the runtime library and assemblies
    /// (default: next to this executable)
    #[arg(short, long)]
    runtime_dir: Option<PathBuf>,

    /// Fail if the assembly directory cannot be read instead of using an empty list
    #[arg(long)]
    strict_scan: bool,

    /// Drop assemblies whose file name was already listed
    #[arg(long)]
    dedupe: bool,

    /// Shut down right away instead of waiting for Enter
    #[arg(long)]
    no_wait: bool,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn host_config(&self) -> rustclr::Result<HostConfig> {
        let mut config = match &self.config {
            Some(path) => HostConfig::from_file(path)?,
            None => HostConfig::default(),
        };
        if let Some(dir) = &self.runtime_dir {
            config.runtime_dir = Some(dir.clone());
        }
        if self.strict_scan {
            config.scan_failure = ScanFailurePolicy::FailFast;
        }
        if self.dedupe {
            config.deduplicate = true;
        }
        if self.no_wait {
            config.wait_for_input = false;
        }
        Ok(config)
    }
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let sink: Arc<dyn OutputSink> = Arc::new(StdoutSink);
    let config = match cli.host_config() {
        Ok(config) => config,
        Err(err) => {
            sink.line(&format!("Bootstrap failed: {}", err));
            process::exit(bootstrap::EXIT_FAILURE);
        }
    };

    let platform = Platform::current();
    let wait_for_input = config.wait_for_input;
    let prompt = Arc::clone(&sink);
    let bootstrap = Bootstrap::new(config, platform, Arc::clone(&sink));
    let outcome = bootstrap.run(CoreClrLoader::new(platform), move || {
        if wait_for_input {
            prompt.line("Press Enter to shut down");
            let mut line = String::new();
            let _ = io::stdin().lock().read_line(&mut line);
        }
    });

    process::exit(bootstrap::exit_code(&outcome));
}
