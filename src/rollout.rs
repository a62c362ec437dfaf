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

//! The rollout controller.
//!
//! Drives the full deployment sequence: apply the manifest, pause the
//! rollout before any replica is promoted, poll the newest replica's health
//! until a terminal verdict or the attempt budget runs out, then resume and
//! wait — or roll back.

use std::fmt;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::cluster::{ClusterError, ClusterOps};
use crate::config::PollConfig;
use crate::health::{HealthEvaluator, Verdict};

/// Why a deployment was rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackReason {
    /// A container in the newest pod is crash-looping.
    ContainerNotStarting,
    /// The image could not be pulled across consecutive attempts.
    BadImage,
    /// The attempt budget ran out without a terminal verdict.
    NeverHealthy,
    /// The operator aborted the deployment.
    Aborted,
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RollbackReason::ContainerNotStarting => "container not starting up correctly",
            RollbackReason::BadImage => "bad image",
            RollbackReason::NeverHealthy => "never became healthy",
            RollbackReason::Aborted => "operator abort",
        };
        f.write_str(reason)
    }
}

/// Errors terminating a deployment run.
#[derive(Error, Debug)]
pub enum DeployError {
    /// The health gate failed and the deployment was rolled back.
    #[error("deployment rolled back: {reason}")]
    RolledBack {
        /// Why the gate failed.
        reason: RollbackReason,
    },

    /// A cluster call outside the polling loop failed. Not a rollback: when
    /// this happens during resume-and-wait, the health gate already passed.
    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

/// Successful outcomes of a deployment run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The health gate passed and the rollout completed.
    Completed {
        /// Name of the deployed deployment.
        deployment: String,
    },
    /// The manifest contained no deployment, so no health gate was applied.
    NothingToWatch,
}

/// Internal decision of the polling phase.
enum GateVerdict {
    Pass,
    Fail(RollbackReason),
}

/// Orchestrates one deployment's apply, health gate and rollback.
pub struct RolloutController<'a> {
    cluster: &'a dyn ClusterOps,
    poll: PollConfig,
}

impl<'a> RolloutController<'a> {
    /// Creates a controller over the given cluster client.
    pub fn new(cluster: &'a dyn ClusterOps, poll: PollConfig) -> Self {
        Self { cluster, poll }
    }

    /// Runs the full deployment sequence for a rendered manifest.
    ///
    /// Cancelling `cancel` while the gate is polling rolls the deployment
    /// back with [`RollbackReason::Aborted`].
    pub async fn run(
        &self,
        manifest: &str,
        cancel: &CancellationToken,
    ) -> Result<Outcome, DeployError> {
        let Some(deployment) = self.cluster.apply(manifest).await? else {
            tracing::warn!("manifest contained no deployment, nothing to monitor");
            return Ok(Outcome::NothingToWatch);
        };
        tracing::info!(deployment = %deployment, "applied manifest");

        // Give the control plane a moment to observe the new revision, then
        // hold the rollout so unhealthy replicas never receive traffic ahead
        // of the decision.
        tokio::time::sleep(self.poll.settle_delay).await;
        self.cluster.pause_rollout(&deployment).await?;
        tracing::info!(deployment = %deployment, "paused rollout pending health check");

        match self.poll_health(&deployment, cancel).await {
            GateVerdict::Pass => {
                self.cluster.resume_rollout(&deployment).await?;
                tracing::info!(deployment = %deployment, "health gate passed, resuming rollout");
                self.cluster.wait_rollout_complete(&deployment).await?;
                tracing::info!(deployment = %deployment, "rollout complete");
                Ok(Outcome::Completed { deployment })
            }
            GateVerdict::Fail(reason) => {
                tracing::error!(deployment = %deployment, %reason, "health gate failed");
                self.roll_back(&deployment).await;
                Err(DeployError::RolledBack { reason })
            }
        }
    }

    /// Polls the newest replica until the gate decides or the attempt budget
    /// runs out.
    ///
    /// Evaluation failures are inconclusive ticks, not health failures: they
    /// are logged, cost their attempt, and polling continues.
    async fn poll_health(&self, deployment: &str, cancel: &CancellationToken) -> GateVerdict {
        let evaluator = HealthEvaluator::new(self.cluster);
        let mut last_pod: Option<String> = None;

        for attempt in 1..=self.poll.max_attempts {
            if cancel.is_cancelled() {
                return GateVerdict::Fail(RollbackReason::Aborted);
            }

            match evaluator.evaluate(deployment).await {
                Ok(sample) => {
                    if sample.pod.is_some() {
                        last_pod = sample.pod;
                    }
                    match sample.verdict {
                        Verdict::Healthy => return GateVerdict::Pass,
                        Verdict::CrashLoop { container } => {
                            tracing::error!(
                                deployment,
                                container = %container,
                                "container is crash looping"
                            );
                            self.emit_pod_logs(last_pod.as_deref()).await;
                            return GateVerdict::Fail(RollbackReason::ContainerNotStarting);
                        }
                        Verdict::ImagePullFailure { reason } => {
                            // Image pulls can be transiently slow; tolerate
                            // the first sighting only.
                            if attempt > 1 {
                                tracing::error!(
                                    deployment,
                                    reason = %reason,
                                    "image still cannot be pulled"
                                );
                                return GateVerdict::Fail(RollbackReason::BadImage);
                            }
                            tracing::warn!(
                                deployment,
                                reason = %reason,
                                "having trouble pulling the image"
                            );
                        }
                        Verdict::Pending => {
                            tracing::info!(
                                deployment,
                                attempt,
                                "waiting for newest pod to become healthy"
                            );
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        deployment,
                        attempt,
                        error = %e,
                        "health evaluation failed, treating tick as inconclusive"
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return GateVerdict::Fail(RollbackReason::Aborted),
                _ = tokio::time::sleep(self.poll.interval) => {}
            }
        }

        self.emit_pod_logs(last_pod.as_deref()).await;
        GateVerdict::Fail(RollbackReason::NeverHealthy)
    }

    /// Rolls the deployment back to its previous revision.
    ///
    /// A paused rollout cannot be undone cleanly, so the rollout is resumed
    /// first. Failures of the resume or undo calls are logged and swallowed;
    /// the caller still reports the health reason that triggered rollback.
    async fn roll_back(&self, deployment: &str) {
        tracing::warn!(deployment, "rolling back deployment");

        if let Err(e) = self.cluster.resume_rollout(deployment).await {
            tracing::error!(deployment, error = %e, "failed to resume rollout before undo");
        }
        tokio::time::sleep(self.poll.rollback_settle).await;
        if let Err(e) = self.cluster.undo_rollout(deployment).await {
            tracing::error!(deployment, error = %e, "failed to undo rollout");
        }

        tracing::warn!(deployment, "rolled back deployment");
    }

    /// Best-effort capture of a failing pod's logs for operator diagnosis.
    async fn emit_pod_logs(&self, pod: Option<&str>) {
        let Some(pod) = pod else { return };
        match self.cluster.pod_logs(pod).await {
            Ok(logs) => {
                tracing::info!(pod, "logs of failing pod:\n{logs}");
            }
            Err(e) => {
                tracing::warn!(pod, error = %e, "could not fetch pod logs");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::cluster::{
        self, ContainerWaiting, DeploymentStatusSummary, LabelSelector, PodDetail, PodSummary,
    };

    /// One scripted health tick, consumed by `deployment_status`.
    enum Tick {
        /// Fast path: every updated replica available.
        FastHealthy,
        /// Degraded status; the newest pod reports the given detail.
        Pod(PodDetail),
        /// The status query itself fails.
        StatusError,
    }

    struct ScriptedCluster {
        ticks: Mutex<VecDeque<Tick>>,
        current_detail: Mutex<PodDetail>,
        calls: Mutex<Vec<String>>,
        apply_name: Option<String>,
        fail_logs: bool,
    }

    impl ScriptedCluster {
        fn new(ticks: Vec<Tick>) -> Self {
            Self {
                ticks: Mutex::new(ticks.into()),
                current_detail: Mutex::new(pending_detail()),
                calls: Mutex::new(Vec::new()),
                apply_name: Some("web".to_string()),
                fail_logs: false,
            }
        }

        fn without_deployment(mut self) -> Self {
            self.apply_name = None;
            self
        }

        fn with_failing_logs(mut self) -> Self {
            self.fail_logs = true;
            self
        }

        fn record(&self, call: &str) {
            self.calls.lock().unwrap().push(call.to_string());
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn status_calls(&self) -> usize {
            self.calls().iter().filter(|c| *c == "status").count()
        }
    }

    fn pending_detail() -> PodDetail {
        PodDetail {
            phase: Some("Pending".to_string()),
            ready: None,
            waiting: Vec::new(),
        }
    }

    fn crash_loop_detail() -> PodDetail {
        PodDetail {
            phase: Some("Running".to_string()),
            ready: Some(false),
            waiting: vec![ContainerWaiting {
                container: "web".to_string(),
                reason: "CrashLoopBackOff".to_string(),
            }],
        }
    }

    fn image_pull_detail() -> PodDetail {
        PodDetail {
            phase: Some("Pending".to_string()),
            ready: None,
            waiting: vec![ContainerWaiting {
                container: "web".to_string(),
                reason: "ImagePullBackOff".to_string(),
            }],
        }
    }

    #[async_trait]
    impl ClusterOps for ScriptedCluster {
        async fn apply(&self, _manifest: &str) -> cluster::Result<Option<String>> {
            self.record("apply");
            Ok(self.apply_name.clone())
        }

        async fn deployment_status(
            &self,
            _name: &str,
        ) -> cluster::Result<DeploymentStatusSummary> {
            self.record("status");
            // Script exhausted means the pod just stays pending.
            let tick = self
                .ticks
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Tick::Pod(pending_detail()));
            match tick {
                Tick::FastHealthy => Ok(DeploymentStatusSummary {
                    desired_replicas: 2,
                    updated_replicas: 2,
                    available_replicas: 2,
                    unavailable_replicas: None,
                }),
                Tick::Pod(detail) => {
                    *self.current_detail.lock().unwrap() = detail;
                    Ok(DeploymentStatusSummary {
                        desired_replicas: 2,
                        updated_replicas: 2,
                        available_replicas: 1,
                        unavailable_replicas: Some(1),
                    })
                }
                Tick::StatusError => Err(cluster::ClusterError::MissingField(
                    "simulated transport failure".to_string(),
                )),
            }
        }

        async fn deployment_selector(&self, _name: &str) -> cluster::Result<LabelSelector> {
            self.record("selector");
            Ok(LabelSelector::from([(
                "app".to_string(),
                "web".to_string(),
            )]))
        }

        async fn list_pods(&self, _selector: &LabelSelector) -> cluster::Result<Vec<PodSummary>> {
            self.record("list_pods");
            Ok(vec![PodSummary {
                name: "web-6b9c-x1".to_string(),
                creation_timestamp: Some(Utc.timestamp_opt(1000, 0).unwrap()),
            }])
        }

        async fn pod_detail(&self, _name: &str) -> cluster::Result<PodDetail> {
            self.record("detail");
            Ok(self.current_detail.lock().unwrap().clone())
        }

        async fn pod_logs(&self, name: &str) -> cluster::Result<String> {
            self.record("logs");
            if self.fail_logs {
                return Err(cluster::ClusterError::MissingField(format!(
                    "pod {name} not found"
                )));
            }
            Ok("panic: oh no\n".to_string())
        }

        async fn pause_rollout(&self, _name: &str) -> cluster::Result<()> {
            self.record("pause");
            Ok(())
        }

        async fn resume_rollout(&self, _name: &str) -> cluster::Result<()> {
            self.record("resume");
            Ok(())
        }

        async fn undo_rollout(&self, _name: &str) -> cluster::Result<()> {
            self.record("undo");
            Ok(())
        }

        async fn wait_rollout_complete(&self, _name: &str) -> cluster::Result<()> {
            self.record("wait");
            Ok(())
        }
    }

    fn controller(cluster: &ScriptedCluster) -> RolloutController<'_> {
        RolloutController::new(cluster, PollConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_first_tick_resumes_and_waits() {
        let cluster = ScriptedCluster::new(vec![Tick::FastHealthy]);
        let cancel = CancellationToken::new();

        let outcome = controller(&cluster).run("---", &cancel).await.unwrap();

        assert_eq!(
            outcome,
            Outcome::Completed {
                deployment: "web".to_string()
            }
        );
        assert_eq!(
            cluster.calls(),
            vec!["apply", "pause", "status", "resume", "wait"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_loop_rolls_back_on_first_attempt() {
        let cluster = ScriptedCluster::new(vec![Tick::Pod(crash_loop_detail())]);
        let cancel = CancellationToken::new();

        let err = controller(&cluster).run("---", &cancel).await.unwrap_err();

        assert!(matches!(
            err,
            DeployError::RolledBack {
                reason: RollbackReason::ContainerNotStarting
            }
        ));
        assert_eq!(cluster.status_calls(), 1);
        assert_eq!(
            cluster.calls(),
            vec![
                "apply", "pause", "status", "selector", "list_pods", "detail", "logs", "resume",
                "undo"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_pull_tolerated_once_then_fatal() {
        let cluster = ScriptedCluster::new(vec![
            Tick::Pod(image_pull_detail()),
            Tick::Pod(image_pull_detail()),
        ]);
        let cancel = CancellationToken::new();

        let err = controller(&cluster).run("---", &cancel).await.unwrap_err();

        assert!(matches!(
            err,
            DeployError::RolledBack {
                reason: RollbackReason::BadImage
            }
        ));
        assert_eq!(cluster.status_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_image_pull_then_recovery_completes() {
        let cluster =
            ScriptedCluster::new(vec![Tick::Pod(image_pull_detail()), Tick::FastHealthy]);
        let cancel = CancellationToken::new();

        let outcome = controller(&cluster).run("---", &cancel).await.unwrap();

        assert!(matches!(outcome, Outcome::Completed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_forever_times_out_after_attempt_budget() {
        let cluster = ScriptedCluster::new(Vec::new());
        let cancel = CancellationToken::new();
        let started = tokio::time::Instant::now();

        let err = controller(&cluster).run("---", &cancel).await.unwrap_err();

        assert!(matches!(
            err,
            DeployError::RolledBack {
                reason: RollbackReason::NeverHealthy
            }
        ));
        assert_eq!(cluster.status_calls(), 24);
        // 2s settle + 24 ticks at 5s + 1s rollback settle.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(122), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(125), "elapsed {elapsed:?}");
        // The last observed pod's logs were captured before the undo.
        assert!(cluster.calls().contains(&"logs".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_log_fetch_failure_on_timeout_is_swallowed() {
        let cluster = ScriptedCluster::new(Vec::new()).with_failing_logs();
        let cancel = CancellationToken::new();

        let err = controller(&cluster).run("---", &cancel).await.unwrap_err();

        assert!(matches!(
            err,
            DeployError::RolledBack {
                reason: RollbackReason::NeverHealthy
            }
        ));
        let calls = cluster.calls();
        assert_eq!(calls.last().unwrap(), "undo");
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_tick_is_inconclusive() {
        let cluster = ScriptedCluster::new(vec![Tick::StatusError, Tick::FastHealthy]);
        let cancel = CancellationToken::new();

        let outcome = controller(&cluster).run("---", &cancel).await.unwrap();

        assert!(matches!(outcome, Outcome::Completed { .. }));
        assert_eq!(cluster.status_calls(), 2);
        assert!(!cluster.calls().contains(&"undo".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_deployment_name_is_trivial_success() {
        let cluster = ScriptedCluster::new(Vec::new()).without_deployment();
        let cancel = CancellationToken::new();

        let outcome = controller(&cluster).run("---", &cancel).await.unwrap();

        assert_eq!(outcome, Outcome::NothingToWatch);
        assert_eq!(cluster.calls(), vec!["apply"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_rolls_back() {
        let cluster = ScriptedCluster::new(Vec::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = controller(&cluster).run("---", &cancel).await.unwrap_err();

        assert!(matches!(
            err,
            DeployError::RolledBack {
                reason: RollbackReason::Aborted
            }
        ));
        assert_eq!(cluster.calls(), vec!["apply", "pause", "resume", "undo"]);
    }
}
