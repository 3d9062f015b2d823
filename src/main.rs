//! Binary entry point for the podforge CLI.

use std::io::{self, Write};
use std::process;

use camino::Utf8PathBuf;
use clap::Parser;
use thiserror::Error;

use podforge::build::{BuildDriver, BuildOptions, TunnelledWorkspace};
use podforge::buildpod::BuildPodManager;
use podforge::cluster::KubectlClient;
use podforge::config::PodforgeConfig;
use podforge::{BuildError, services};

mod cli;

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("service discovery failed: {0}")]
    Discovery(String),
    #[error("no project or service named {0}")]
    UnknownTarget(String),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("{failed} of {total} service builds failed")]
    ServiceBuilds { failed: usize, total: usize },
}

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: cli::Cli) -> Result<i32, CliError> {
    match cli {
        cli::Cli::Build(command) => build_command(command).await,
    }
}

async fn build_command(args: cli::BuildCommand) -> Result<i32, CliError> {
    let config =
        PodforgeConfig::load_without_cli_args().map_err(|err| CliError::Config(err.to_string()))?;
    config
        .validate()
        .map_err(|err| CliError::Config(err.to_string()))?;

    let discovered = services::discover(config.source_root(), config.search_depth)
        .map_err(|err| CliError::Discovery(err.to_string()))?;
    let (project, selected) = services::select(&discovered, &args.name)
        .ok_or_else(|| CliError::UnknownTarget(args.name.clone()))?;

    let cluster_settings = config.cluster_settings();
    let pods = BuildPodManager::new(
        KubectlClient::new(cluster_settings.clone()),
        config.poll_settings(),
        cluster_settings.namespace.clone(),
    )
    .with_fixed_password(config.sftp_password.clone());
    let workspace = TunnelledWorkspace {
        cluster: cluster_settings,
        user: config.sftp_user.clone(),
        connect_attempts: config.connect_attempts,
        connect_retry_delay: config.connect_retry_delay(),
        tunnel_timeout: config.tunnel_timeout(),
    };
    let driver = BuildDriver::new(
        pods,
        workspace,
        Utf8PathBuf::from(config.source_root.clone()),
        config.ui_dir.clone(),
        config.registry.clone(),
        config.deletion_timeout(),
    );

    let options = BuildOptions {
        skip_ui: args.skip_ui,
        force: args.force,
        flush: args.flush,
    };
    let report = driver.build(&project, &selected, options).await?;

    if report.failures.is_empty() {
        Ok(0)
    } else {
        Err(CliError::ServiceBuilds {
            failed: report.failures.len(),
            total: report.failures.len() + report.built.len(),
        })
    }
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_renders_the_cli_error() {
        let mut buf = Vec::new();
        let err = CliError::UnknownTarget(String::from("shop"));

        write_error(&mut buf, &err);

        let rendered = String::from_utf8(buf).expect("utf8");
        assert_eq!(rendered, "no project or service named shop\n");
    }

    #[test]
    fn service_build_failures_are_summarised() {
        let err = CliError::ServiceBuilds {
            failed: 1,
            total: 3,
        };

        assert_eq!(err.to_string(), "1 of 3 service builds failed");
    }
}
