//! Command-line interface definitions for the `podforge` binary.
//!
//! This module centralises the clap parser structures so both the main binary
//! and the build script can reuse them when generating the manual page.

use clap::Parser;

/// Top-level CLI for the `podforge` binary.
#[derive(Debug, Parser)]
#[command(
    name = "podforge",
    about = "Mirror your workspace into an in-cluster build pod and build images there",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Sync a project into the build pod and build its service images.
    #[command(
        name = "build",
        about = "Sync a project into the build pod and build its services"
    )]
    Build(BuildCommand),
}

/// Arguments for the `podforge build` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct BuildCommand {
    /// Project or service name to build.
    ///
    /// A project name builds every service the project declares; a service
    /// name builds just that service within its project.
    #[arg(required = true, value_name = "PROJECT")]
    pub(crate) name: String,
    /// Leave the front-end directory out of the sync and skip its services.
    #[arg(long)]
    pub(crate) skip_ui: bool,
    /// Build even when the sync detected no changes.
    #[arg(long)]
    pub(crate) force: bool,
    /// Recreate the build pod first, discarding accumulated build caches.
    #[arg(long)]
    pub(crate) flush: bool,
}
