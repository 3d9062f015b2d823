//! Core library for the podforge inner-loop build tool.
//!
//! podforge mirrors a local source tree into a cluster-resident build pod
//! and runs container image builds there. The crate exposes the build pod
//! provisioner, the port tunnel to its SFTP endpoint, the workspace
//! mirror, and the driver that sequences them (flush → provision →
//! tunnel → sync → per-service builds).

pub mod build;
pub mod buildpod;
pub mod cluster;
pub mod config;
pub mod report;
pub mod services;
pub mod sync;
pub mod tunnel;

pub use build::{
    BuildDriver, BuildError, BuildOptions, BuildReport, MirrorFuture, ServiceFailure,
    TunnelledWorkspace, Workspace, build_command,
};
pub use buildpod::{
    BUILD_CONTAINER, BUILD_POD_NAME, BuildPodManager, PollSettings, ProvisionError,
};
pub use cluster::{
    ClusterClient, ClusterError, ClusterSettings, CommandOutput, KubectlClient, PodStatus,
};
pub use config::{ConfigError, PodforgeConfig};
pub use report::Console;
pub use services::{DiscoveryError, Service};
pub use sync::{
    ChangeSet, ConnectSettings, EXCLUDED_DIRS, FileTransfer, Mirror, RemoteEntry, SftpSession,
    SyncError, SyncTarget,
};
pub use tunnel::{Tunnel, TunnelError, free_local_port};
