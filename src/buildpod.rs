//! Build pod provisioning and lifecycle management.
//!
//! The build pod is the cluster-resident environment that receives the
//! mirrored workspace and runs image builds. Provisioning is idempotent:
//! the pod is keyed by a fixed name and reused across invocations, and the
//! SFTP credential is recorded in a pod annotation so a later invocation
//! recovers the value the running pod was configured with. The workspace
//! volume outlives the pod; build-tool caches live in the pod's own
//! storage, which is why deleting the pod ("flush") evicts them without
//! losing the synced sources.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::sleep;
use uuid::Uuid;

use crate::cluster::{ClusterClient, ClusterError, PodStatus};

/// Fixed name of the build pod; server-side idempotency keys off it.
pub const BUILD_POD_NAME: &str = "podforge-build";

/// Container inside the pod that runs image builds.
pub const BUILD_CONTAINER: &str = "buildah";

/// Container-side port served by the SFTP endpoint.
pub const SFTP_PORT: u16 = 22;

/// Annotation key carrying the SFTP credential on the pod.
pub const CREDENTIAL_ANNOTATION: &str = "podforge.io/sftp-password";

/// Poll cadence and bound for provisioning waits.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollSettings {
    /// Pause between pod lookups.
    pub interval: Duration,
    /// Upper bound for the pod to reach `Running`.
    pub ready_timeout: Duration,
}

/// Errors raised while managing the build pod.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Raised when a control-plane call fails outright.
    #[error("cluster request failed: {0}")]
    Cluster(#[from] ClusterError),
    /// Raised when the pod does not reach `Running` within the bound.
    #[error("build pod {name} did not reach Running within {secs}s", secs = timeout.as_secs())]
    ProvisioningTimeout {
        /// Pod that was being provisioned.
        name: String,
        /// Bound that was exceeded.
        timeout: Duration,
    },
    /// Raised when a deleted pod is still present after the bound.
    ///
    /// Callers may proceed; recreation can fail until the old pod releases
    /// its storage, which is a reported, non-fatal condition.
    #[error("build pod {name} was still present after {secs}s", secs = timeout.as_secs())]
    DeletionTimeout {
        /// Pod that was being removed.
        name: String,
        /// Bound that was exceeded.
        timeout: Duration,
    },
    /// Raised when the orchestrator rejects the deletion request.
    #[error("failed to delete build pod {name}: {source}")]
    Teardown {
        /// Pod whose deletion was rejected.
        name: String,
        /// Underlying control-plane error.
        #[source]
        source: ClusterError,
    },
    /// Raised when a running pod carries no recorded credential.
    #[error("build pod {name} is running without a recorded credential")]
    MissingCredential {
        /// Pod missing the credential annotation.
        name: String,
    },
}

/// Idempotent provisioner for the build pod.
#[derive(Clone, Debug)]
pub struct BuildPodManager<C: ClusterClient> {
    cluster: C,
    poll: PollSettings,
    namespace: String,
    fixed_password: Option<String>,
}

impl<C: ClusterClient> BuildPodManager<C> {
    /// Creates a manager over the given cluster client.
    #[must_use]
    pub const fn new(cluster: C, poll: PollSettings, namespace: String) -> Self {
        Self {
            cluster,
            poll,
            namespace,
            fixed_password: None,
        }
    }

    /// Pins the SFTP credential instead of generating one per cycle.
    #[must_use]
    pub fn with_fixed_password(mut self, password: Option<String>) -> Self {
        self.fixed_password = password;
        self
    }

    /// Cluster client used for pod management; also carries exec traffic.
    #[must_use]
    pub const fn cluster(&self) -> &C {
        &self.cluster
    }

    /// Ensures the build pod exists and is `Running`, returning its
    /// SFTP credential.
    ///
    /// When the pod is already running this is a pure probe: no manifest is
    /// applied and the credential recorded at provisioning time is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::ProvisioningTimeout`] when the pod does not
    /// reach `Running` within the configured bound, and propagates
    /// control-plane failures.
    pub async fn ensure_ready(&self) -> Result<String, ProvisionError> {
        if let Some(status) = self.cluster.get_pod(BUILD_POD_NAME)? {
            if status.is_running() {
                return credential_of(&status);
            }
            // Submitted by an earlier invocation and still coming up.
            return self.await_running().await;
        }

        let password = self.new_password();
        self.cluster
            .apply(&build_pod_manifest(&self.namespace, &password))?;
        self.await_running().await
    }

    /// Reports whether the build pod currently exists in any phase.
    ///
    /// # Errors
    ///
    /// Propagates control-plane failures; absence is `Ok(false)`.
    pub fn exists(&self) -> Result<bool, ProvisionError> {
        Ok(self.cluster.get_pod(BUILD_POD_NAME)?.is_some())
    }

    /// Requests deletion of the build pod without waiting for completion.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::Teardown`] when the orchestrator rejects
    /// the deletion.
    pub fn destroy(&self) -> Result<(), ProvisionError> {
        self.cluster
            .delete_pod(BUILD_POD_NAME)
            .map_err(|source| ProvisionError::Teardown {
                name: BUILD_POD_NAME.to_owned(),
                source,
            })
    }

    /// Polls until the pod is gone or `timeout` elapses.
    ///
    /// A zero timeout performs a single probe and reports immediately.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::DeletionTimeout`] when the pod is still
    /// present at the deadline.
    pub async fn await_deletion(&self, timeout: Duration) -> Result<(), ProvisionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.exists()? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ProvisionError::DeletionTimeout {
                    name: BUILD_POD_NAME.to_owned(),
                    timeout,
                });
            }
            sleep(self.poll.interval).await;
        }
    }

    async fn await_running(&self) -> Result<String, ProvisionError> {
        let deadline = Instant::now() + self.poll.ready_timeout;
        while Instant::now() <= deadline {
            if let Some(status) = self.cluster.get_pod(BUILD_POD_NAME)? {
                if status.is_running() {
                    return credential_of(&status);
                }
            }
            sleep(self.poll.interval).await;
        }

        Err(ProvisionError::ProvisioningTimeout {
            name: BUILD_POD_NAME.to_owned(),
            timeout: self.poll.ready_timeout,
        })
    }

    fn new_password(&self) -> String {
        self.fixed_password
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string())
    }
}

fn credential_of(status: &PodStatus) -> Result<String, ProvisionError> {
    status
        .annotations
        .get(CREDENTIAL_ANNOTATION)
        .cloned()
        .ok_or_else(|| ProvisionError::MissingCredential {
            name: BUILD_POD_NAME.to_owned(),
        })
}

/// Renders the declarative specification of the build environment: the
/// workspace volume, its claim, and the pod pairing an SFTP endpoint with
/// the build toolchain. Both containers mount the same workspace volume;
/// the SFTP account is chrooted to its home directory, so uploads under
/// `workspace/` land where the build container sees `/var/workspace`.
#[must_use]
pub fn build_pod_manifest(namespace: &str, password: &str) -> String {
    format!(
        r#"apiVersion: v1
kind: PersistentVolume
metadata:
  labels:
    type: local
  name: podforge-workspace-pv
spec:
  accessModes:
  - ReadWriteOnce
  capacity:
    storage: 20Gi
  claimRef:
    name: podforge-workspace-pvc
    namespace: {namespace}
  hostPath:
    path: /var/podforge-workspace
  storageClassName: ""
---
apiVersion: v1
kind: PersistentVolumeClaim
metadata:
  name: podforge-workspace-pvc
  namespace: {namespace}
spec:
  accessModes:
  - ReadWriteOnce
  resources:
    requests:
      storage: 20Gi
  storageClassName: ""
---
apiVersion: v1
kind: Pod
metadata:
  labels:
    app: podforge-build
  name: {BUILD_POD_NAME}
  namespace: {namespace}
  annotations:
    {CREDENTIAL_ANNOTATION}: "{password}"
spec:
  containers:
  - name: sftp
    image: atmoz/sftp:alpine
    args:
    - "user:{password}:::workspace"
    ports:
    - containerPort: {SFTP_PORT}
    volumeMounts:
    - mountPath: /home/user/workspace
      name: workspace
  - name: {BUILD_CONTAINER}
    image: quay.io/buildah/stable:latest
    command: ["sleep", "infinity"]
    securityContext:
      privileged: true
    volumeMounts:
    - mountPath: /var/workspace
      name: workspace
    - mountPath: /var/lib/containers
      name: container-storage
  volumes:
  - name: workspace
    persistentVolumeClaim:
      claimName: podforge-workspace-pvc
  - emptyDir: {{}}
    name: container-storage
"#
    )
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{BTreeMap, VecDeque};
    use std::rc::Rc;

    use super::*;
    use crate::cluster::CommandOutput;

    #[derive(Default)]
    struct ClusterState {
        pod: Option<PodStatus>,
        /// Phases handed out by successive lookups once a pod exists.
        phase_script: VecDeque<String>,
        apply_calls: u32,
        delete_calls: u32,
        delete_error: bool,
    }

    #[derive(Clone, Default)]
    struct ScriptedCluster {
        state: Rc<RefCell<ClusterState>>,
    }

    impl ScriptedCluster {
        fn with_running_pod(credential: &str) -> Self {
            let cluster = Self::default();
            cluster.state.borrow_mut().pod = Some(PodStatus {
                phase: String::from("Running"),
                annotations: BTreeMap::from([(
                    CREDENTIAL_ANNOTATION.to_owned(),
                    credential.to_owned(),
                )]),
            });
            cluster
        }

        fn apply_calls(&self) -> u32 {
            self.state.borrow().apply_calls
        }
    }

    impl ClusterClient for ScriptedCluster {
        fn apply(&self, manifest: &str) -> Result<(), ClusterError> {
            let mut state = self.state.borrow_mut();
            state.apply_calls += 1;
            let credential = manifest
                .lines()
                .find_map(|line| line.trim().strip_prefix(&format!("{CREDENTIAL_ANNOTATION}: ")))
                .map(|value| value.trim_matches('"').to_owned())
                .unwrap_or_default();
            state.pod = Some(PodStatus {
                phase: String::from("Pending"),
                annotations: BTreeMap::from([(CREDENTIAL_ANNOTATION.to_owned(), credential)]),
            });
            Ok(())
        }

        fn get_pod(&self, _name: &str) -> Result<Option<PodStatus>, ClusterError> {
            let mut state = self.state.borrow_mut();
            if let Some(next_phase) = state.phase_script.pop_front() {
                if next_phase == "Absent" {
                    state.pod = None;
                } else if let Some(ref mut pod) = state.pod {
                    pod.phase = next_phase;
                }
            }
            Ok(state.pod.clone())
        }

        fn delete_pod(&self, _name: &str) -> Result<(), ClusterError> {
            let mut state = self.state.borrow_mut();
            state.delete_calls += 1;
            if state.delete_error {
                return Err(ClusterError::CommandFailed {
                    program: String::from("kubectl"),
                    action: String::from("delete pod"),
                    status_text: String::from("1"),
                    stderr: String::from("forbidden"),
                });
            }
            state.pod = None;
            Ok(())
        }

        fn exec(
            &self,
            _pod: &str,
            _container: &str,
            _command: &str,
        ) -> Result<CommandOutput, ClusterError> {
            Ok(CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn fast_poll() -> PollSettings {
        PollSettings {
            interval: Duration::from_millis(1),
            ready_timeout: Duration::from_millis(50),
        }
    }

    fn manager(cluster: ScriptedCluster) -> BuildPodManager<ScriptedCluster> {
        BuildPodManager::new(cluster, fast_poll(), String::from("default"))
    }

    #[tokio::test]
    async fn ensure_ready_reuses_a_running_pod_without_provisioning() {
        let cluster = ScriptedCluster::with_running_pod("known-secret");
        let pods = manager(cluster.clone());

        let first = pods.ensure_ready().await.expect("first call should succeed");
        let second = pods
            .ensure_ready()
            .await
            .expect("second call should succeed");

        assert_eq!(first, "known-secret");
        assert_eq!(second, "known-secret");
        assert_eq!(cluster.apply_calls(), 0);
    }

    #[tokio::test]
    async fn ensure_ready_provisions_an_absent_pod_and_waits_for_running() {
        let cluster = ScriptedCluster::default();
        cluster.state.borrow_mut().phase_script =
            VecDeque::from([String::from("Absent"), String::from("Pending"), String::from("Running")]);
        let pods = manager(cluster.clone());

        let credential = pods.ensure_ready().await.expect("provisioning should succeed");

        assert!(!credential.is_empty());
        assert_eq!(cluster.apply_calls(), 1);
    }

    #[tokio::test]
    async fn ensure_ready_honours_a_fixed_password() {
        let cluster = ScriptedCluster::default();
        cluster.state.borrow_mut().phase_script =
            VecDeque::from([String::from("Absent"), String::from("Running")]);
        let pods = manager(cluster.clone()).with_fixed_password(Some(String::from("pinned")));

        let credential = pods.ensure_ready().await.expect("provisioning should succeed");

        assert_eq!(credential, "pinned");
    }

    #[tokio::test]
    async fn ensure_ready_times_out_when_the_pod_never_runs() {
        let cluster = ScriptedCluster::default();
        cluster.state.borrow_mut().phase_script = VecDeque::from([String::from("Absent")]);
        let pods = manager(cluster);

        let err = pods
            .ensure_ready()
            .await
            .expect_err("a pod stuck in Pending should time out");

        assert!(matches!(err, ProvisionError::ProvisioningTimeout { .. }));
    }

    #[tokio::test]
    async fn ensure_ready_fails_when_a_running_pod_has_no_credential() {
        let cluster = ScriptedCluster::default();
        cluster.state.borrow_mut().pod = Some(PodStatus {
            phase: String::from("Running"),
            annotations: BTreeMap::new(),
        });
        let pods = manager(cluster);

        let err = pods
            .ensure_ready()
            .await
            .expect_err("missing annotation should fail");

        assert!(matches!(err, ProvisionError::MissingCredential { .. }));
    }

    #[tokio::test]
    async fn await_deletion_with_zero_timeout_reports_immediately() {
        let cluster = ScriptedCluster::with_running_pod("secret");
        let pods = manager(cluster);

        let err = pods
            .await_deletion(Duration::ZERO)
            .await
            .expect_err("a live pod should exceed a zero bound");

        assert!(matches!(err, ProvisionError::DeletionTimeout { .. }));
    }

    #[tokio::test]
    async fn await_deletion_returns_once_the_pod_is_gone() {
        let cluster = ScriptedCluster::with_running_pod("secret");
        cluster.state.borrow_mut().phase_script = VecDeque::from([
            String::from("Running"),
            String::from("Running"),
            String::from("Absent"),
        ]);
        let pods = manager(cluster);

        pods.await_deletion(Duration::from_secs(5))
            .await
            .expect("deletion should be observed");
    }

    #[tokio::test]
    async fn destroy_wraps_orchestrator_rejections() {
        let cluster = ScriptedCluster::with_running_pod("secret");
        cluster.state.borrow_mut().delete_error = true;
        let pods = manager(cluster);

        let err = pods.destroy().expect_err("rejection should surface");

        assert!(matches!(err, ProvisionError::Teardown { .. }));
    }

    #[test]
    fn exists_treats_absence_as_false_not_error() {
        let pods = manager(ScriptedCluster::default());

        assert!(!pods.exists().expect("absence should not error"));
    }

    #[test]
    fn manifest_records_the_credential_in_annotation_and_account() {
        let manifest = build_pod_manifest("default", "s3cret");

        assert!(manifest.contains(&format!("{CREDENTIAL_ANNOTATION}: \"s3cret\"")));
        assert!(manifest.contains("user:s3cret:::workspace"));
        assert!(manifest.contains(&format!("name: {BUILD_POD_NAME}")));
    }
}
