// Copyright 2025 The Kubernetes Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! kube-deploy - Health-gated rolling deployments for Kubernetes
//!
//! Applies a templated manifest, pauses the rollout, watches the newest
//! replica until it is healthy, then resumes — or rolls back automatically.

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_deploy_rust::config::DeployConfig;
use kube_deploy_rust::rollout::{Outcome, RolloutController};
use kube_deploy_rust::{credentials, template, KubeCluster};

/// Health-gated rolling deployments
///
/// Applies a Kubernetes manifest, pauses the resulting rollout, and polls
/// the newest pod's health. A healthy pod resumes the rollout; a bad image
/// or a crash-looping container rolls it back.
#[derive(Parser, Debug)]
#[command(name = "kube-deploy")]
#[command(version = "0.1.0")]
#[command(about = "Health-gated rolling deployments", long_about = None)]
struct Args {
    /// Path to the manifest template file
    #[arg(short = 'f', long = "filename")]
    filename: Option<PathBuf>,

    /// Template substitution in KEY=VALUE form (repeatable)
    #[arg(long = "set", value_name = "KEY=VALUE", value_parser = parse_key_value)]
    set: Vec<(String, String)>,

    /// Namespace the deployment lives in
    #[arg(long)]
    namespace: Option<String>,

    /// Path to the kubeconfig file
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from
    #[arg(long)]
    master: Option<String>,

    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    log_json: bool,

    /// Maximum number of health poll attempts
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Interval between health polls
    #[arg(long, value_parser = parse_duration)]
    poll_interval: Option<Duration>,
}

fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    humantime::parse_duration(s).map_err(|e| anyhow::anyhow!("invalid duration: {}", e))
}

fn parse_key_value(s: &str) -> anyhow::Result<(String, String)> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| anyhow::anyhow!("expected KEY=VALUE, got: {}", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.log_json);

    info!("starting kube-deploy");

    // Load or create configuration
    let config = load_config(args).await?;
    config.validate().map_err(|reason| anyhow::anyhow!(reason))?;

    // Credentials must land on disk before any cluster call
    credentials::write_kubeconfig_from_env().await?;

    // Read and render the manifest template
    let template_text = tokio::fs::read_to_string(&config.manifest)
        .await
        .with_context(|| format!("failed to read manifest template: {:?}", config.manifest))?;
    let manifest = template::render(&template_text, &config.vars)
        .context("failed to render manifest template")?;

    // Create Kubernetes client
    let cluster = KubeCluster::connect(&config).await?;

    // Set up signal handling; an operator abort rolls the deployment back
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_shutdown().await;
            cancel.cancel();
        }
    });

    let controller = RolloutController::new(&cluster, config.poll.clone());
    match controller.run(&manifest, &cancel).await {
        Ok(Outcome::Completed { deployment }) => {
            info!(deployment = %deployment, "deployment succeeded");
            Ok(())
        }
        Ok(Outcome::NothingToWatch) => {
            info!("manifest contained no deployment, nothing to monitor");
            Ok(())
        }
        Err(e) => {
            error!("deployment failed: {:#}", e);
            Err(e.into())
        }
    }
}

/// Initializes logging based on the provided level and format.
fn init_logging(level: &str, json: bool) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level.parse().unwrap())
        .from_env_lossy();

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty())
            .init();
    }
}

/// Loads the configuration from file or command-line arguments.
async fn load_config(mut args: Args) -> anyhow::Result<DeployConfig> {
    let mut config = if let Some(config_path) = args.config.take() {
        // Load from file
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("failed to read config file: {config_path:?}"))?;

        DeployConfig::from_yaml(&content)
            .with_context(|| format!("failed to parse config file: {config_path:?}"))?
    } else {
        DeployConfig::default()
    };

    // Override with command-line arguments
    if let Some(filename) = args.filename {
        config.manifest = filename;
    }
    if let Some(namespace) = args.namespace {
        config.namespace = namespace;
    }
    if let Some(kubeconfig) = args.kubeconfig {
        config.kubeconfig = Some(kubeconfig);
    }
    if let Some(master) = args.master {
        config.master = Some(master);
    }
    if let Some(max_attempts) = args.max_attempts {
        config.poll.max_attempts = max_attempts;
    }
    if let Some(interval) = args.poll_interval {
        config.poll.interval = interval;
    }
    for (key, value) in args.set {
        config.vars.insert(key, value);
    }

    Ok(config)
}

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn wait_for_shutdown() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM, aborting deployment");
            }
            _ = sigint.recv() => {
                info!("received SIGINT, aborting deployment");
            }
        }
    }

    #[cfg(windows)]
    {
        let _ = signal::ctrl_c().await;
        info!("received Ctrl+C, aborting deployment");
    }
}
