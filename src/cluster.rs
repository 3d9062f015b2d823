//! Cluster control-plane access through the `kubectl` binary.
//!
//! Every orchestrator call is a synchronous subprocess invocation behind the
//! [`ClusterClient`] trait so tests can substitute a scripted client. A pod
//! lookup that the server answers with "NotFound" is reported as `Ok(None)`:
//! callers probe for absence routinely and must not treat it as failure.

use std::collections::BTreeMap;
use std::io::Write;
use std::process::{Command, Stdio};

use camino::Utf8PathBuf;
use serde::Deserialize;
use thiserror::Error;

/// Result of running a control-plane command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Settings shared by every `kubectl` invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ClusterSettings {
    /// Path or name of the `kubectl` binary.
    pub kubectl_bin: String,
    /// Optional kubeconfig override passed as `--kubeconfig`.
    pub kubeconfig: Option<Utf8PathBuf>,
    /// Namespace holding the build pod.
    pub namespace: String,
}

impl ClusterSettings {
    /// Arguments prepended to every invocation.
    #[must_use]
    pub fn base_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(ref kubeconfig) = self.kubeconfig {
            args.push(format!("--kubeconfig={kubeconfig}"));
        }
        args.push(String::from("--namespace"));
        args.push(self.namespace.clone());
        args
    }
}

/// Phase and metadata snapshot of a pod.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PodStatus {
    /// Lifecycle phase reported by the orchestrator (`Pending`, `Running`, ...).
    pub phase: String,
    /// Annotations attached to the pod.
    pub annotations: BTreeMap<String, String>,
}

impl PodStatus {
    /// Returns `true` once the pod has reached the `Running` phase.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.phase == "Running"
    }
}

/// Errors raised by control-plane calls.
#[derive(Debug, Error)]
pub enum ClusterError {
    /// Raised when the `kubectl` binary cannot be started or driven.
    #[error("failed to run {program}: {message}")]
    Spawn {
        /// Binary that failed to start.
        program: String,
        /// Operating system error string.
        message: String,
    },
    /// Raised when an invocation completes with a non-zero exit code.
    #[error("{program} {action} exited with status {status_text}: {stderr}")]
    CommandFailed {
        /// Binary used for the attempted call.
        program: String,
        /// Verb describing the call (`apply`, `get pod`, ...).
        action: String,
        /// Human readable representation of the exit status.
        status_text: String,
        /// Stderr captured from the process.
        stderr: String,
    },
    /// Raised when a pod description cannot be decoded.
    #[error("failed to parse pod description: {message}")]
    Parse {
        /// Decoder error string.
        message: String,
    },
}

/// Synchronous control-plane operations used by the provisioner and driver.
pub trait ClusterClient {
    /// Applies a declarative manifest supplied on stdin.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the call cannot be made or is rejected.
    fn apply(&self, manifest: &str) -> Result<(), ClusterError>;

    /// Looks up a pod; `Ok(None)` when the pod does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] for failures other than "NotFound".
    fn get_pod(&self, name: &str) -> Result<Option<PodStatus>, ClusterError>;

    /// Deletes a pod without waiting for it to disappear.
    ///
    /// Deleting an already-absent pod succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError`] when the orchestrator rejects the deletion.
    fn delete_pod(&self, name: &str) -> Result<(), ClusterError>;

    /// Runs a shell command inside a pod container and captures its output.
    ///
    /// A non-zero remote exit code is reported through [`CommandOutput`], not
    /// as an error; only a failure to make the call at all errors.
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Spawn`] when the call cannot be made.
    fn exec(&self, pod: &str, container: &str, command: &str)
    -> Result<CommandOutput, ClusterError>;
}

/// Production client that shells out to `kubectl`.
#[derive(Clone, Debug)]
pub struct KubectlClient {
    settings: ClusterSettings,
}

impl KubectlClient {
    /// Creates a client over the given settings.
    #[must_use]
    pub const fn new(settings: ClusterSettings) -> Self {
        Self { settings }
    }

    fn run(
        &self,
        action: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<CommandOutput, ClusterError> {
        let mut command = Command::new(&self.settings.kubectl_bin);
        command
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let spawn_error = |message: String| ClusterError::Spawn {
            program: format!("{} {action}", self.settings.kubectl_bin),
            message,
        };

        let mut child = command.spawn().map_err(|err| spawn_error(err.to_string()))?;
        if let Some(payload) = stdin {
            if let Some(mut handle) = child.stdin.take() {
                handle
                    .write_all(payload.as_bytes())
                    .map_err(|err| spawn_error(err.to_string()))?;
            }
        }
        let output = child
            .wait_with_output()
            .map_err(|err| spawn_error(err.to_string()))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn failure(&self, action: &str, output: &CommandOutput) -> ClusterError {
        ClusterError::CommandFailed {
            program: self.settings.kubectl_bin.clone(),
            action: action.to_owned(),
            status_text: output
                .code
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            stderr: output.stderr.trim().to_owned(),
        }
    }
}

impl ClusterClient for KubectlClient {
    fn apply(&self, manifest: &str) -> Result<(), ClusterError> {
        let mut args = self.settings.base_args();
        args.push(String::from("apply"));
        args.push(String::from("-f"));
        args.push(String::from("-"));

        let output = self.run("apply", &args, Some(manifest))?;
        if output.is_success() {
            Ok(())
        } else {
            Err(self.failure("apply", &output))
        }
    }

    fn get_pod(&self, name: &str) -> Result<Option<PodStatus>, ClusterError> {
        let mut args = self.settings.base_args();
        args.push(String::from("get"));
        args.push(String::from("pod"));
        args.push(name.to_owned());
        args.push(String::from("-o"));
        args.push(String::from("json"));

        let output = self.run("get pod", &args, None)?;
        if output.is_success() {
            parse_pod(&output.stdout).map(Some)
        } else if is_not_found(&output) {
            Ok(None)
        } else {
            Err(self.failure("get pod", &output))
        }
    }

    fn delete_pod(&self, name: &str) -> Result<(), ClusterError> {
        let mut args = self.settings.base_args();
        args.push(String::from("delete"));
        args.push(String::from("pod"));
        args.push(name.to_owned());
        args.push(String::from("--wait=false"));

        let output = self.run("delete pod", &args, None)?;
        if output.is_success() || is_not_found(&output) {
            Ok(())
        } else {
            Err(self.failure("delete pod", &output))
        }
    }

    fn exec(
        &self,
        pod: &str,
        container: &str,
        command: &str,
    ) -> Result<CommandOutput, ClusterError> {
        let mut args = self.settings.base_args();
        args.push(String::from("exec"));
        args.push(format!("pod/{pod}"));
        args.push(String::from("-c"));
        args.push(container.to_owned());
        args.push(String::from("--"));
        args.push(String::from("/bin/sh"));
        args.push(String::from("-c"));
        args.push(command.to_owned());

        self.run("exec", &args, None)
    }
}

fn is_not_found(output: &CommandOutput) -> bool {
    output.stderr.contains("NotFound")
}

#[derive(Deserialize)]
struct PodDescription {
    #[serde(default)]
    metadata: PodMetadata,
    #[serde(default)]
    status: PodStatusBlock,
}

#[derive(Default, Deserialize)]
struct PodMetadata {
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Default, Deserialize)]
struct PodStatusBlock {
    #[serde(default)]
    phase: String,
}

fn parse_pod(raw: &str) -> Result<PodStatus, ClusterError> {
    let description: PodDescription =
        serde_json::from_str(raw).map_err(|err| ClusterError::Parse {
            message: err.to_string(),
        })?;
    Ok(PodStatus {
        phase: description.status.phase,
        annotations: description.metadata.annotations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pod_extracts_phase_and_annotations() {
        let raw = r#"{
            "metadata": {"annotations": {"podforge.io/sftp-password": "s3cret"}},
            "status": {"phase": "Running"}
        }"#;

        let status = parse_pod(raw).expect("pod description should parse");

        assert!(status.is_running());
        assert_eq!(
            status.annotations.get("podforge.io/sftp-password"),
            Some(&String::from("s3cret"))
        );
    }

    #[test]
    fn parse_pod_tolerates_missing_sections() {
        let status = parse_pod("{}").expect("empty description should parse");

        assert!(!status.is_running());
        assert!(status.annotations.is_empty());
    }

    #[test]
    fn parse_pod_rejects_garbage() {
        let err = parse_pod("not json").expect_err("garbage should not parse");

        assert!(matches!(err, ClusterError::Parse { .. }));
    }

    #[test]
    fn not_found_is_detected_from_stderr() {
        let output = CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: String::from("Error from server (NotFound): pods \"podforge-build\" not found"),
        };

        assert!(is_not_found(&output));
    }

    #[test]
    fn base_args_include_kubeconfig_when_set() {
        let settings = ClusterSettings {
            kubectl_bin: String::from("kubectl"),
            kubeconfig: Some(Utf8PathBuf::from("/home/dev/.kube/config")),
            namespace: String::from("default"),
        };

        let args = settings.base_args();

        assert_eq!(
            args,
            vec![
                String::from("--kubeconfig=/home/dev/.kube/config"),
                String::from("--namespace"),
                String::from("default"),
            ]
        );
    }
}
