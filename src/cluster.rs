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

//! The cluster capability boundary.
//!
//! Everything the rollout controller and health evaluator need from the
//! orchestration API is expressed as the [`ClusterOps`] trait, so the state
//! machine can be exercised against an in-memory cluster in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from the cluster client.
#[derive(Error, Debug)]
pub enum ClusterError {
    /// The underlying API call failed (transport, auth, server error).
    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),

    /// A manifest document could not be parsed or resolved to a resource.
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// A resource was missing a field the operation depends on.
    #[error("{0}")]
    MissingField(String),

    /// The deployment has no earlier revision to roll back to.
    #[error("no rollout history for deployment {0}")]
    NoHistory(String),
}

/// Result type for cluster operations.
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Label-equality constraints scoping pod queries to one deployment's pods.
pub type LabelSelector = BTreeMap<String, String>;

/// Replica counts from a deployment's status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentStatusSummary {
    /// Replicas the deployment wants.
    pub desired_replicas: i32,
    /// Replicas at the newest revision.
    pub updated_replicas: i32,
    /// Replicas currently available.
    pub available_replicas: i32,
    /// Replicas reported unavailable, absent when none are.
    pub unavailable_replicas: Option<i32>,
}

impl DeploymentStatusSummary {
    /// The fast-path check: every updated replica is available and nothing
    /// is reported unavailable, so the rollout never took the service down.
    pub fn all_available(&self) -> bool {
        self.updated_replicas == self.available_replicas && self.unavailable_replicas.is_none()
    }
}

/// The little a pod listing needs to expose: enough to find the newest pod.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSummary {
    /// Pod name.
    pub name: String,
    /// Creation time, used to order pods oldest to newest.
    pub creation_timestamp: Option<DateTime<Utc>>,
}

/// A container stuck in a waiting state, with the reason the kubelet gave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerWaiting {
    /// Container name within the pod.
    pub container: String,
    /// Waiting reason, e.g. `ImagePullBackOff` or `CrashLoopBackOff`.
    pub reason: String,
}

/// Detailed status of a single pod, fetched only for the pod under
/// evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodDetail {
    /// Lifecycle phase, e.g. `Pending` or `Running`.
    pub phase: Option<String>,
    /// Whether the `Ready` condition is true, when the condition is present.
    pub ready: Option<bool>,
    /// Waiting containers, in the order the API reports them.
    pub waiting: Vec<ContainerWaiting>,
}

/// Capability contract for the orchestration API.
///
/// Implementations mutate nothing beyond what each method names; every read
/// is point-in-time, with no caching between calls.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Applies a rendered manifest and returns the name of the deployment it
    /// contained, if any. `None` means there is nothing to health-gate.
    async fn apply(&self, manifest: &str) -> Result<Option<String>>;

    /// Fetches the replica counts of a deployment.
    async fn deployment_status(&self, name: &str) -> Result<DeploymentStatusSummary>;

    /// Fetches the pod-template label selector of a deployment.
    async fn deployment_selector(&self, name: &str) -> Result<LabelSelector>;

    /// Lists pods matching a label selector.
    async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<PodSummary>>;

    /// Fetches the detailed status of one pod by name.
    async fn pod_detail(&self, name: &str) -> Result<PodDetail>;

    /// Fetches a pod's logs. Fails if the pod is absent.
    async fn pod_logs(&self, name: &str) -> Result<String>;

    /// Pauses a deployment's rollout.
    async fn pause_rollout(&self, name: &str) -> Result<()>;

    /// Resumes a paused rollout.
    async fn resume_rollout(&self, name: &str) -> Result<()>;

    /// Rolls a deployment back to its previous revision.
    async fn undo_rollout(&self, name: &str) -> Result<()>;

    /// Blocks until the rollout reports completion.
    async fn wait_rollout_complete(&self, name: &str) -> Result<()>;
}
