use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{HostError, Result};
use crate::tpa::ScanFailurePolicy;

/// Everything the bootstrap needs to know about the runtime and the managed library.
///
/// Loaded from TOML; every field is optional in the file.
///
/// ```toml
/// runtime_dir = "/opt/app"
/// assembly_name = "ManagedLibrary, Version=1.0.0.0"
/// scan_failure = "fail-fast"
/// call_timeout_ms = 5000
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Directory holding the runtime library and the assemblies. Defaults to the
    /// directory of the host executable.
    pub runtime_dir: Option<PathBuf>,
    pub app_domain: String,
    /// File name of the managed library, expected inside `runtime_dir`.
    pub assembly_file: String,
    /// Display name used to resolve delegates.
    pub assembly_name: String,
    pub type_name: String,
    pub initialize_method: String,
    pub message_method: String,
    pub tpa_extension: String,
    pub scan_failure: ScanFailurePolicy,
    pub deduplicate: bool,
    pub message_suffix: String,
    pub call_timeout_ms: Option<u64>,
    pub wait_for_input: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        HostConfig {
            runtime_dir: None,
            app_domain: "rusty".to_string(),
            assembly_file: "ManagedLibrary.dll".to_string(),
            assembly_name: "ManagedLibrary, Version=1.0.0.0".to_string(),
            type_name: "ManagedLibrary.ManagedWorker".to_string(),
            initialize_method: "Initialize".to_string(),
            message_method: "SayHello".to_string(),
            tpa_extension: ".dll".to_string(),
            scan_failure: ScanFailurePolicy::Silent,
            deduplicate: false,
            message_suffix: "from Rust".to_string(),
            call_timeout_ms: None,
            wait_for_input: true,
        }
    }
}

impl HostConfig {
    pub fn from_file(path: &Path) -> Result<HostConfig> {
        let text = fs::read_to_string(path)
            .map_err(|e| HostError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        HostConfig::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<HostConfig> {
        let config: HostConfig =
            toml::from_str(text).map_err(|e| HostError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("app_domain", &self.app_domain),
            ("assembly_file", &self.assembly_file),
            ("assembly_name", &self.assembly_name),
            ("type_name", &self.type_name),
            ("initialize_method", &self.initialize_method),
            ("message_method", &self.message_method),
            ("tpa_extension", &self.tpa_extension),
        ];
        for (key, value) in required {
            if value.is_empty() {
                return Err(HostError::Config(format!("`{}` must not be empty", key)));
            }
        }
        if self.call_timeout_ms == Some(0) {
            return Err(HostError::Config("`call_timeout_ms` must be positive".to_string()));
        }
        Ok(())
    }

    pub fn runtime_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.runtime_dir {
            return Ok(dir.clone());
        }
        let exe = env::current_exe()
            .map_err(|e| HostError::Config(format!("cannot locate the host executable: {}", e)))?;
        exe.parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| HostError::Config(format!("{} has no parent directory", exe.display())))
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        assert_eq!(HostConfig::from_toml("").unwrap(), HostConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = HostConfig::from_toml(
            r#"
            runtime_dir = "/opt/app"
            scan_failure = "fail-fast"
            deduplicate = true
            call_timeout_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.runtime_dir().unwrap(), PathBuf::from("/opt/app"));
        assert_eq!(config.scan_failure, ScanFailurePolicy::FailFast);
        assert!(config.deduplicate);
        assert_eq!(config.call_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.type_name, "ManagedLibrary.ManagedWorker");
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(matches!(
            HostConfig::from_toml("runtime = \"x\""),
            Err(HostError::Config(_))
        ));
    }

    #[test]
    fn empty_names_are_rejected() {
        assert!(HostConfig::from_toml("type_name = \"\"").is_err());
        assert!(HostConfig::from_toml("call_timeout_ms = 0").is_err());
    }

    #[test]
    fn runtime_dir_defaults_to_executable_directory() {
        let dir = HostConfig::default().runtime_dir().unwrap();
        let exe = env::current_exe().unwrap();
        assert_eq!(Some(dir.as_path()), exe.parent());
    }

    #[test]
    fn reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.toml");
        fs::write(&path, "message_suffix = \"native\"\n").unwrap();
        assert_eq!(HostConfig::from_file(&path).unwrap().message_suffix, "native");
        assert!(HostConfig::from_file(&dir.path().join("nope.toml")).is_err());
    }
}
