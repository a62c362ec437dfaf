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

//! kube-deploy-rust - Health-gated rolling deployments for Kubernetes
//!
//! This library provides the building blocks for a rolling deployment with
//! an automatic, health-gated rollback:
//! - A capability-typed cluster client boundary
//! - A kube-rs backed implementation of that boundary
//! - A health evaluator for the newest replica of a deployment
//! - A rollout controller driving apply, pause, poll, resume and undo

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod health;
pub mod rollout;
pub mod template;

// Re-export commonly used types
pub use client::KubeCluster;
pub use cluster::{ClusterError, ClusterOps, DeploymentStatusSummary, PodDetail, PodSummary};
pub use config::{DeployConfig, PollConfig};
pub use health::{HealthEvaluator, HealthSample, Verdict};
pub use rollout::{DeployError, Outcome, RollbackReason, RolloutController};

/// Semantic version of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default name for the deploy tool.
pub const DEPLOYER_NAME: &str = "kube-deploy";
