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

//! Health evaluation for the newest replica of a deployment.
//!
//! Each call reads live cluster state and classifies it; nothing is cached
//! between calls. The evaluator only reports what it saw — escalation
//! decisions (how many bad ticks to tolerate) belong to the rollout
//! controller.

use crate::cluster::{self, ClusterOps};

/// Waiting reasons that mean the image cannot be pulled right now.
const IMAGE_PULL_REASONS: [&str; 2] = ["ImagePullBackOff", "ErrImagePull"];

/// Waiting reason for a container that starts and dies repeatedly.
const CRASH_LOOP_REASON: &str = "CrashLoopBackOff";

/// One health classification of the newest replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The rollout is safe to proceed.
    Healthy,
    /// The newest pod cannot pull its image.
    ImagePullFailure {
        /// The waiting reason as reported by the kubelet.
        reason: String,
    },
    /// A container in the newest pod is crash-looping. Always fatal — a
    /// crash-looping container will not self-heal.
    CrashLoop {
        /// Name of the offending container.
        container: String,
    },
    /// Not yet decided; keep polling.
    Pending,
}

/// A verdict plus the pod it was derived from.
///
/// The pod name is absent when the deployment-level fast path decided
/// without inspecting any pod; callers use it for diagnostic log capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSample {
    /// The classification.
    pub verdict: Verdict,
    /// Name of the inspected pod, when one was inspected.
    pub pod: Option<String>,
}

impl HealthSample {
    fn deployment_wide(verdict: Verdict) -> Self {
        Self { verdict, pod: None }
    }

    fn for_pod(verdict: Verdict, pod: &str) -> Self {
        Self {
            verdict,
            pod: Some(pod.to_string()),
        }
    }
}

/// Classifies the health of a deployment's newest replica.
pub struct HealthEvaluator<'a> {
    cluster: &'a dyn ClusterOps,
}

impl<'a> HealthEvaluator<'a> {
    /// Creates an evaluator reading through the given cluster client.
    pub fn new(cluster: &'a dyn ClusterOps) -> Self {
        Self { cluster }
    }

    /// Evaluates the deployment once.
    ///
    /// Client failures propagate unchanged; they are never mapped to a
    /// health verdict.
    pub async fn evaluate(&self, deployment: &str) -> cluster::Result<HealthSample> {
        let status = self.cluster.deployment_status(deployment).await?;

        // Fast path: previous replicas stayed up throughout the rollout, so
        // there is nothing to gate on. Skips all pod queries.
        if status.all_available() {
            tracing::debug!(deployment, "all updated replicas available");
            return Ok(HealthSample::deployment_wide(Verdict::Healthy));
        }

        let selector = self.cluster.deployment_selector(deployment).await?;
        let mut pods = self.cluster.list_pods(&selector).await?;
        pods.sort_by_key(|p| p.creation_timestamp);

        // The newest pod is the one the rollout just created.
        let Some(newest) = pods.last() else {
            tracing::debug!(deployment, "no pods matched selector yet");
            return Ok(HealthSample::deployment_wide(Verdict::Pending));
        };

        // A second, more expensive query, issued only for the pod under
        // suspicion.
        let detail = self.cluster.pod_detail(&newest.name).await?;

        // Running and Ready wins over any simultaneously-waiting container.
        if detail.phase.as_deref() == Some("Running") && detail.ready == Some(true) {
            return Ok(HealthSample::for_pod(Verdict::Healthy, &newest.name));
        }

        for waiting in &detail.waiting {
            if IMAGE_PULL_REASONS.contains(&waiting.reason.as_str()) {
                return Ok(HealthSample::for_pod(
                    Verdict::ImagePullFailure {
                        reason: waiting.reason.clone(),
                    },
                    &newest.name,
                ));
            }
            if waiting.reason == CRASH_LOOP_REASON {
                return Ok(HealthSample::for_pod(
                    Verdict::CrashLoop {
                        container: waiting.container.clone(),
                    },
                    &newest.name,
                ));
            }
        }

        Ok(HealthSample::for_pod(Verdict::Pending, &newest.name))
    }
}
