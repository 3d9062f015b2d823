//! End-to-end build orchestration.
//!
//! A build optionally flushes the pod, provisions it, mirrors the project
//! into it over a short-lived tunnel, and then runs one image build per
//! service through the command-execution channel. The tunnel and transfer
//! session never outlive the sync; build commands go through `kubectl
//! exec` into the already-running pod.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use shell_escape::unix::escape;
use thiserror::Error;

use crate::buildpod::{BUILD_CONTAINER, BUILD_POD_NAME, BuildPodManager, ProvisionError};
use crate::cluster::{ClusterClient, ClusterSettings};
use crate::report::Console;
use crate::services::Service;
use crate::sync::{ChangeSet, ConnectSettings, Mirror, SftpSession, SyncError, SyncTarget};
use crate::tunnel::{Tunnel, TunnelError, free_local_port};

/// Pod-side path where the workspace volume is mounted for builds.
pub const WORKSPACE_PATH: &str = "/var/workspace";

/// Workspace directory as seen from the SFTP chroot.
pub const SFTP_WORKSPACE_PATH: &str = "workspace";

/// Flags controlling one build invocation.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BuildOptions {
    /// Leave the front-end directory out of the sync and skip its services.
    pub skip_ui: bool,
    /// Build even when the sync found no changes.
    pub force: bool,
    /// Recreate the build pod first to discard build-tool caches.
    pub flush: bool,
}

/// Failure of a single service build; siblings keep building.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ServiceFailure {
    /// Service whose build failed.
    pub service: String,
    /// Failure rendered for diagnostics.
    pub message: String,
}

/// Outcome of one build invocation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BuildReport {
    /// Changes applied by the workspace sync.
    pub changes: ChangeSet,
    /// Services whose images were built and pushed.
    pub built: Vec<String>,
    /// Services whose builds failed.
    pub failures: Vec<ServiceFailure>,
    /// `true` when building was skipped because nothing changed.
    pub skipped: bool,
}

/// Errors that abort a build invocation.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The build pod could not be provisioned; nothing proceeds without it.
    #[error("failed to provision the build pod: {0}")]
    Provision(#[from] ProvisionError),
    /// The tunnel to the pod's SFTP endpoint could not be established.
    #[error("failed to open the sync tunnel: {0}")]
    Tunnel(#[from] TunnelError),
    /// The workspace sync aborted; the pod stays provisioned for a retry.
    #[error("workspace sync failed: {0}")]
    Sync(#[from] SyncError),
}

/// Future returned by workspace mirroring strategies.
pub type MirrorFuture<'a> = Pin<Box<dyn Future<Output = Result<ChangeSet, BuildError>> + Send + 'a>>;

/// Strategy for mirroring a target into the build pod.
pub trait Workspace {
    /// Mirrors `target` into the pod, authenticating with `credential`.
    fn mirror<'a>(&'a self, target: &'a SyncTarget, credential: &'a str) -> MirrorFuture<'a>;
}

/// Production mirror strategy: a `kubectl port-forward` tunnel on a free
/// local port, an SFTP session over it, and the tree mirror on top.
#[derive(Clone, Debug)]
pub struct TunnelledWorkspace {
    /// `kubectl` settings used to spawn the tunnel.
    pub cluster: ClusterSettings,
    /// SFTP account configured in the build pod.
    pub user: String,
    /// Dial attempts before giving up.
    pub connect_attempts: u32,
    /// Pause between dial attempts.
    pub connect_retry_delay: Duration,
    /// Bound for the tunnel readiness scan.
    pub tunnel_timeout: Duration,
}

impl Workspace for TunnelledWorkspace {
    fn mirror<'a>(&'a self, target: &'a SyncTarget, credential: &'a str) -> MirrorFuture<'a> {
        Box::pin(async move {
            let local_port = free_local_port()?;
            let tunnel = Tunnel::open(&self.cluster, local_port, self.tunnel_timeout).await?;

            let connect = ConnectSettings {
                host: String::from("127.0.0.1"),
                port: tunnel.local_port(),
                user: self.user.clone(),
                password: credential.to_owned(),
                attempts: self.connect_attempts,
                retry_delay: self.connect_retry_delay,
            };
            let outcome = mirror_over(&connect, target);
            tunnel.close();
            outcome.map_err(BuildError::Sync)
        })
    }
}

fn mirror_over(connect: &ConnectSettings, target: &SyncTarget) -> Result<ChangeSet, SyncError> {
    let session = SftpSession::connect(connect)?;
    Mirror::new(target, &session).run()
}

/// Drives the full build workflow against the build pod.
#[derive(Debug)]
pub struct BuildDriver<C: ClusterClient, W: Workspace> {
    pods: BuildPodManager<C>,
    workspace: W,
    source_root: Utf8PathBuf,
    ui_dir: String,
    registry: String,
    deletion_timeout: Duration,
    console: Console,
}

impl<C: ClusterClient, W: Workspace> BuildDriver<C, W> {
    /// Creates a driver over a provisioner and a mirror strategy.
    #[must_use]
    pub const fn new(
        pods: BuildPodManager<C>,
        workspace: W,
        source_root: Utf8PathBuf,
        ui_dir: String,
        registry: String,
        deletion_timeout: Duration,
    ) -> Self {
        Self {
            pods,
            workspace,
            source_root,
            ui_dir,
            registry,
            deletion_timeout,
            console: Console::new(),
        }
    }

    /// Runs flush, provisioning, sync, and per-service builds for
    /// `project`.
    ///
    /// Flush failures are reported and execution continues. Provisioning,
    /// tunnel, and sync failures abort the invocation; the pod stays
    /// provisioned after a sync failure so a retry is cheap. Individual
    /// service build failures are collected in the report without
    /// aborting sibling builds.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError`] for provisioning, tunnel, or sync failures.
    pub async fn build(
        &self,
        project: &str,
        services: &[Service],
        options: BuildOptions,
    ) -> Result<BuildReport, BuildError> {
        self.console.note(&format!("Building project {project}"));

        if options.flush {
            self.flush().await;
        }

        let credential = self.pods.ensure_ready().await?;

        let target = SyncTarget::new(
            self.source_root.join(project),
            Utf8PathBuf::from(SFTP_WORKSPACE_PATH).join(project),
            self.ui_dir.clone(),
            options.skip_ui,
        );
        self.console
            .note(&format!("Mirroring {} into the build pod", target.local_root));
        let changes = self.workspace.mirror(&target, &credential).await?;
        self.console.note(&format!(
            "Sync finished: {} added, {} updated, {} deleted in {:.1?}",
            changes.added, changes.updated, changes.deleted, changes.elapsed
        ));

        let mut report = BuildReport {
            changes,
            built: Vec::new(),
            failures: Vec::new(),
            skipped: false,
        };

        if changes.is_empty() && !options.force {
            self.console.note(&format!(
                "No changes detected in project {project}, skipping build"
            ));
            report.skipped = true;
            return Ok(report);
        }

        for service in services {
            if options.skip_ui && is_ui_service(service, &self.ui_dir) {
                continue;
            }
            self.console
                .note(&format!("Building service {}", service.name));
            match self.build_service(service) {
                Ok(()) => report.built.push(service.name.clone()),
                Err(message) => {
                    self.console
                        .warn(&format!("build of {} failed: {message}", service.name));
                    report.failures.push(ServiceFailure {
                        service: service.name.clone(),
                        message,
                    });
                }
            }
        }

        Ok(report)
    }

    /// Deletes the build pod to evict build-tool caches. Every failure
    /// here is reported and survived: a missed flush only means stale
    /// caches, never a broken build.
    async fn flush(&self) {
        match self.pods.exists() {
            Err(err) => self
                .console
                .warn(&format!("could not probe the build pod before flush: {err}")),
            Ok(false) => {}
            Ok(true) => {
                self.console
                    .note("Flushing the build pod to discard build caches");
                if let Err(err) = self.pods.destroy() {
                    self.console
                        .warn(&format!("failed to delete the build pod: {err}"));
                    return;
                }
                match self.pods.await_deletion(self.deletion_timeout).await {
                    Ok(()) => self.console.note("Previous build pod fully removed"),
                    Err(err) => self.console.warn(&format!(
                        "{err}; recreating anyway, which may fail until the old pod releases its storage"
                    )),
                }
            }
        }
    }

    fn build_service(&self, service: &Service) -> Result<(), String> {
        let command = build_command(service, &self.registry);
        let output = self
            .pods
            .cluster()
            .exec(BUILD_POD_NAME, BUILD_CONTAINER, &command)
            .map_err(|err| err.to_string())?;

        if output.is_success() {
            Ok(())
        } else {
            Err(format!(
                "build command exited with status {}: {}",
                output
                    .code
                    .map_or_else(|| String::from("unknown"), |code| code.to_string()),
                output.stderr.trim()
            ))
        }
    }
}

fn is_ui_service(service: &Service, ui_dir: &str) -> bool {
    Utf8Path::new(&service.path).file_name() == Some(ui_dir)
}

/// Renders the in-pod build-and-push command for one service.
#[must_use]
pub fn build_command(service: &Service, registry: &str) -> String {
    let image = format!("{registry}/{}", service.name);
    let dockerfile = format!(
        "{WORKSPACE_PATH}/{}/{}/{}/Dockerfile",
        service.project, service.path, service.dockerfile
    );
    let context = format!("{WORKSPACE_PATH}/{}/{}", service.project, service.context);

    let bud = format!(
        "buildah bud -t {} -f {} {}",
        escape(image.clone().into()),
        escape(dockerfile.into()),
        escape(context.into())
    );
    let push = format!(
        "buildah push {} {}",
        escape(format!("{image}:latest").into()),
        escape(format!("docker://{image}:latest").into())
    );
    format!("{bud} && {push}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(name: &str, path: &str) -> Service {
        Service {
            name: name.to_owned(),
            project: String::from("shop"),
            path: path.to_owned(),
            dockerfile: String::from("docker"),
            context: String::from("."),
        }
    }

    #[test]
    fn build_command_targets_the_workspace_mount() {
        let command = build_command(&service("shop-api", "src/api"), "registry:5000");

        assert_eq!(
            command,
            "buildah bud -t 'registry:5000/shop-api' \
             -f /var/workspace/shop/src/api/docker/Dockerfile /var/workspace/shop/. \
             && buildah push 'registry:5000/shop-api:latest' \
             'docker://registry:5000/shop-api:latest'"
        );
    }

    #[test]
    fn ui_services_are_recognised_by_path_base_name() {
        assert!(is_ui_service(&service("shop-web", "src/web"), "web"));
        assert!(!is_ui_service(&service("shop-api", "src/api"), "web"));
        assert!(!is_ui_service(&service("shop-webby", "src/webby"), "web"));
    }
}
