//! Configuration loading via `ortho-config`.
//!
//! Values merge defaults, configuration files, and environment variables.
//! The loaded struct is passed explicitly into every component; nothing
//! reads configuration through a global.

use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;

use crate::buildpod::PollSettings;
use crate::cluster::ClusterSettings;

/// Settings for one podforge invocation.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PODFORGE",
    discovery(
        app_name = "podforge",
        env_var = "PODFORGE_CONFIG_PATH",
        config_file_name = "podforge.toml",
        dotfile_name = ".podforge.toml",
        project_file_name = "podforge.toml"
    )
)]
pub struct PodforgeConfig {
    /// Root directory containing the project trees. This value is required.
    pub source_root: String,
    /// Registry receiving built images. This value is required.
    pub registry: String,
    /// Directory levels below the source root searched for service
    /// manifests.
    #[ortho_config(default = 2)]
    pub search_depth: u16,
    /// Path or name of the `kubectl` binary.
    #[ortho_config(default = "kubectl".to_owned())]
    pub kubectl_bin: String,
    /// Optional kubeconfig path passed to every `kubectl` invocation.
    pub kubeconfig: Option<String>,
    /// Namespace holding the build pod.
    #[ortho_config(default = "default".to_owned())]
    pub namespace: String,
    /// Front-end directory name skipped by `--skip-ui`.
    #[ortho_config(default = "web".to_owned())]
    pub ui_dir: String,
    /// SFTP account configured in the build pod.
    #[ortho_config(default = "user".to_owned())]
    pub sftp_user: String,
    /// Fixed SFTP password. Leave unset to mint a fresh credential per
    /// provisioning cycle, which is the safer default.
    pub sftp_password: Option<String>,
    /// Pause between pod lookups while waiting, in milliseconds.
    #[ortho_config(default = 500)]
    pub poll_interval_ms: u64,
    /// Bound for the pod to reach `Running`, in seconds.
    #[ortho_config(default = 90)]
    pub ready_timeout_secs: u64,
    /// Bound for a flushed pod to disappear, in seconds.
    #[ortho_config(default = 45)]
    pub deletion_timeout_secs: u64,
    /// Bound for the port-forward readiness marker, in seconds.
    #[ortho_config(default = 30)]
    pub tunnel_timeout_secs: u64,
    /// SFTP dial attempts before giving up.
    #[ortho_config(default = 5)]
    pub connect_attempts: u32,
    /// Pause between SFTP dial attempts, in seconds.
    #[ortho_config(default = 2)]
    pub connect_retry_delay_secs: u64,
}

/// Errors raised when loading or validating the configuration.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates that parsing or merging configuration layers failed.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
    /// Raised when a required value is empty after trimming.
    #[error("missing {field}: set PODFORGE_{env_suffix} or add {field} to podforge.toml", env_suffix = field.to_uppercase())]
    Missing {
        /// Configuration field that failed validation.
        field: String,
    },
    /// Raised when a numeric value is outside its permitted range.
    #[error("{field} must be at least 1")]
    OutOfRange {
        /// Configuration field that failed validation.
        field: String,
    },
}

impl PodforgeConfig {
    /// Loads configuration from defaults, configuration files, and
    /// environment variables without consulting CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when merging sources fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("podforge")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Ensures configuration values are present after trimming whitespace.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] for empty required fields and
    /// [`ConfigError::OutOfRange`] for a zero dial budget.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_value(&self.source_root, "source_root")?;
        Self::require_value(&self.registry, "registry")?;
        Self::require_value(&self.kubectl_bin, "kubectl_bin")?;
        Self::require_value(&self.namespace, "namespace")?;
        Self::require_value(&self.ui_dir, "ui_dir")?;
        Self::require_value(&self.sftp_user, "sftp_user")?;
        Self::require_optional_value(self.sftp_password.as_deref(), "sftp_password")?;
        if self.connect_attempts == 0 {
            return Err(ConfigError::OutOfRange {
                field: String::from("connect_attempts"),
            });
        }
        Ok(())
    }

    /// Source root as a typed path.
    #[must_use]
    pub fn source_root(&self) -> &Utf8Path {
        Utf8Path::new(&self.source_root)
    }

    /// `kubectl` invocation settings.
    #[must_use]
    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings {
            kubectl_bin: self.kubectl_bin.clone(),
            kubeconfig: self.kubeconfig.clone().map(Utf8PathBuf::from),
            namespace: self.namespace.clone(),
        }
    }

    /// Poll cadence and bound for provisioning waits.
    #[must_use]
    pub const fn poll_settings(&self) -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(self.poll_interval_ms),
            ready_timeout: Duration::from_secs(self.ready_timeout_secs),
        }
    }

    /// Bound for a flushed pod to disappear.
    #[must_use]
    pub const fn deletion_timeout(&self) -> Duration {
        Duration::from_secs(self.deletion_timeout_secs)
    }

    /// Bound for the port-forward readiness marker.
    #[must_use]
    pub const fn tunnel_timeout(&self) -> Duration {
        Duration::from_secs(self.tunnel_timeout_secs)
    }

    /// Pause between SFTP dial attempts.
    #[must_use]
    pub const fn connect_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connect_retry_delay_secs)
    }

    fn require_value(value: &str, field: &str) -> Result<(), ConfigError> {
        Self::require_optional_value(Some(value), field)
    }

    fn require_optional_value(value: Option<&str>, field: &str) -> Result<(), ConfigError> {
        match value {
            None => Ok(()),
            Some(present) if !present.trim().is_empty() => Ok(()),
            Some(_) => Err(ConfigError::Missing {
                field: field.to_owned(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PodforgeConfig {
        PodforgeConfig {
            source_root: String::from("/src"),
            registry: String::from("registry:5000"),
            search_depth: 2,
            kubectl_bin: String::from("kubectl"),
            kubeconfig: None,
            namespace: String::from("default"),
            ui_dir: String::from("web"),
            sftp_user: String::from("user"),
            sftp_password: None,
            poll_interval_ms: 500,
            ready_timeout_secs: 90,
            deletion_timeout_secs: 45,
            tunnel_timeout_secs: 30,
            connect_attempts: 5,
            connect_retry_delay_secs: 2,
        }
    }

    #[test]
    fn a_complete_configuration_validates() {
        config().validate().expect("defaults should validate");
    }

    #[test]
    fn blank_required_fields_are_rejected_with_guidance() {
        let mut broken = config();
        broken.registry = String::from("  ");

        let err = broken.validate().expect_err("blank registry should fail");

        assert_eq!(
            err.to_string(),
            "missing registry: set PODFORGE_REGISTRY or add registry to podforge.toml"
        );
    }

    #[test]
    fn a_zero_dial_budget_is_rejected() {
        let mut broken = config();
        broken.connect_attempts = 0;

        let err = broken.validate().expect_err("zero attempts should fail");

        assert!(matches!(err, ConfigError::OutOfRange { .. }));
    }

    #[test]
    fn duration_accessors_convert_units() {
        let settings = config();

        assert_eq!(settings.poll_settings().interval, Duration::from_millis(500));
        assert_eq!(settings.deletion_timeout(), Duration::from_secs(45));
        assert_eq!(settings.tunnel_timeout(), Duration::from_secs(30));
        assert_eq!(settings.connect_retry_delay(), Duration::from_secs(2));
    }
}
