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

//! kube-rs backed implementation of the cluster capability boundary.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DynamicObject, ListParams, LogParams, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::{Discovery, Scope};
use kube::ResourceExt;

use crate::cluster::{
    ClusterError, ClusterOps, ContainerWaiting, DeploymentStatusSummary, LabelSelector, PodDetail,
    PodSummary, Result,
};
use crate::config::DeployConfig;

/// Field manager identity for server-side apply.
const FIELD_MANAGER: &str = "kube-deploy";

/// Revision annotation the deployment controller stamps on replica sets.
const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Label the deployment controller adds to a replica set's pod template.
const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// How often to re-check the deployment while waiting for rollout
/// completion.
const ROLLOUT_WAIT_INTERVAL: Duration = Duration::from_secs(2);

/// A namespaced Kubernetes cluster client.
pub struct KubeCluster {
    client: kube::Client,
    namespace: String,
}

impl KubeCluster {
    /// Builds a client from the deploy configuration: an explicit kubeconfig
    /// path, a master URL, or the inferred environment, in that order.
    pub async fn connect(config: &DeployConfig) -> anyhow::Result<Self> {
        use kube::config::{KubeConfigOptions, Kubeconfig};
        use kube::Config;

        let kube_config = if let Some(kubeconfig_path) = &config.kubeconfig {
            let kubeconfig = Kubeconfig::read_from(kubeconfig_path)
                .with_context(|| format!("failed to read kubeconfig from: {kubeconfig_path:?}"))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("failed to load kubeconfig from: {kubeconfig_path:?}"))?
        } else if let Some(master_url) = &config.master {
            let uri = master_url
                .parse::<http::Uri>()
                .with_context(|| format!("invalid master URL: {master_url}"))?;
            Config::new(uri)
        } else {
            Config::infer().await.context("failed to load kubeconfig")?
        };

        Ok(Self {
            client: kube::Client::try_from(kube_config)?,
            namespace: config.namespace.clone(),
        })
    }

    fn deployments(&self) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn replica_sets(&self) -> Api<ReplicaSet> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn set_paused(&self, name: &str, paused: bool) -> Result<()> {
        let patch = serde_json::json!({ "spec": { "paused": paused } });
        self.deployments()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Formats label-equality constraints for a list query.
fn selector_string(selector: &LabelSelector) -> String {
    selector
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Splits manifest text into its non-empty YAML documents.
fn multidoc(data: &str) -> Result<Vec<serde_yaml::Value>> {
    use serde::Deserialize;

    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(data) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| ClusterError::Manifest(e.to_string()))?;
        if !value.is_null() {
            docs.push(value);
        }
    }
    Ok(docs)
}

/// Whether the deployment's status has caught up with its spec.
fn rollout_complete(deploy: &Deployment) -> bool {
    let generation = deploy.metadata.generation.unwrap_or(0);
    let Some(status) = &deploy.status else {
        return false;
    };
    if status.observed_generation.unwrap_or(0) < generation {
        return false;
    }
    let desired = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    status.updated_replicas.unwrap_or(0) >= desired
        && status.available_replicas.unwrap_or(0) >= desired
        && status.unavailable_replicas.is_none()
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn apply(&self, manifest: &str) -> Result<Option<String>> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut deployment = None;

        for doc in multidoc(manifest)? {
            let obj: DynamicObject =
                serde_yaml::from_value(doc).map_err(|e| ClusterError::Manifest(e.to_string()))?;
            let gvk = obj
                .types
                .as_ref()
                .ok_or_else(|| {
                    ClusterError::Manifest("document missing apiVersion or kind".to_string())
                })
                .and_then(|tm| {
                    GroupVersionKind::try_from(tm).map_err(|e| ClusterError::Manifest(e.to_string()))
                })?;
            let name = obj.name_any();
            let Some((ar, caps)) = discovery.resolve_gvk(&gvk) else {
                return Err(ClusterError::Manifest(format!(
                    "unknown resource kind {}",
                    gvk.kind
                )));
            };

            let api: Api<DynamicObject> = if caps.scope == Scope::Namespaced {
                Api::namespaced_with(self.client.clone(), &self.namespace, &ar)
            } else {
                Api::all_with(self.client.clone(), &ar)
            };
            api.patch(
                &name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&obj),
            )
            .await?;
            tracing::info!(kind = %gvk.kind, name = %name, "applied manifest document");

            if gvk.kind == "Deployment" {
                deployment = Some(name);
            }
        }

        Ok(deployment)
    }

    async fn deployment_status(&self, name: &str) -> Result<DeploymentStatusSummary> {
        let deploy = self.deployments().get(name).await?;
        let desired = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
        let status = deploy.status.unwrap_or_default();
        Ok(DeploymentStatusSummary {
            desired_replicas: desired,
            updated_replicas: status.updated_replicas.unwrap_or(0),
            available_replicas: status.available_replicas.unwrap_or(0),
            unavailable_replicas: status.unavailable_replicas,
        })
    }

    async fn deployment_selector(&self, name: &str) -> Result<LabelSelector> {
        let deploy = self.deployments().get(name).await?;
        let selector = deploy
            .spec
            .and_then(|s| s.selector.match_labels)
            .unwrap_or_default();
        if selector.is_empty() {
            return Err(ClusterError::MissingField(format!(
                "deployment {name} has no matchLabels selector"
            )));
        }
        Ok(selector)
    }

    async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<PodSummary>> {
        let params = ListParams::default().labels(&selector_string(selector));
        let pods = self.pods().list(&params).await?;
        Ok(pods
            .items
            .into_iter()
            .map(|pod| PodSummary {
                name: pod.name_any(),
                creation_timestamp: pod.metadata.creation_timestamp.map(|t| t.0),
            })
            .collect())
    }

    async fn pod_detail(&self, name: &str) -> Result<PodDetail> {
        let pod = self.pods().get(name).await?;
        let status = pod.status.unwrap_or_default();

        let ready = status.conditions.as_ref().and_then(|conditions| {
            conditions
                .iter()
                .find(|c| c.type_ == "Ready")
                .map(|c| c.status == "True")
        });
        let waiting = status
            .container_statuses
            .unwrap_or_default()
            .into_iter()
            .filter_map(|cs| {
                let reason = cs
                    .state
                    .as_ref()
                    .and_then(|state| state.waiting.as_ref())
                    .and_then(|waiting| waiting.reason.clone())?;
                Some(ContainerWaiting {
                    container: cs.name,
                    reason,
                })
            })
            .collect();

        Ok(PodDetail {
            phase: status.phase,
            ready,
            waiting,
        })
    }

    async fn pod_logs(&self, name: &str) -> Result<String> {
        Ok(self.pods().logs(name, &LogParams::default()).await?)
    }

    async fn pause_rollout(&self, name: &str) -> Result<()> {
        self.set_paused(name, true).await
    }

    async fn resume_rollout(&self, name: &str) -> Result<()> {
        self.set_paused(name, false).await
    }

    async fn undo_rollout(&self, name: &str) -> Result<()> {
        let deploy = self.deployments().get(name).await?;
        let uid = deploy
            .metadata
            .uid
            .clone()
            .ok_or_else(|| ClusterError::MissingField(format!("deployment {name} has no uid")))?;
        let selector = deploy
            .spec
            .as_ref()
            .and_then(|s| s.selector.match_labels.clone())
            .unwrap_or_default();
        if selector.is_empty() {
            return Err(ClusterError::MissingField(format!(
                "deployment {name} has no matchLabels selector"
            )));
        }

        // Walk the deployment's replica sets by revision and re-instate the
        // pod template of the revision before the current one.
        let params = ListParams::default().labels(&selector_string(&selector));
        let sets = self.replica_sets().list(&params).await?;
        let mut revisions: Vec<(u64, ReplicaSet)> = sets
            .items
            .into_iter()
            .filter(|rs| {
                rs.metadata
                    .owner_references
                    .as_deref()
                    .unwrap_or(&[])
                    .iter()
                    .any(|r| r.uid == uid)
            })
            .filter_map(|rs| {
                let revision = rs
                    .metadata
                    .annotations
                    .as_ref()?
                    .get(REVISION_ANNOTATION)?
                    .parse::<u64>()
                    .ok()?;
                Some((revision, rs))
            })
            .collect();
        revisions.sort_by_key(|(revision, _)| *revision);

        let Some(latest) = revisions.last().map(|(revision, _)| *revision) else {
            return Err(ClusterError::NoHistory(name.to_string()));
        };
        let (revision, previous) = revisions
            .iter()
            .rev()
            .find(|(revision, _)| *revision < latest)
            .ok_or_else(|| ClusterError::NoHistory(name.to_string()))?;

        let mut template = previous
            .spec
            .as_ref()
            .and_then(|s| s.template.clone())
            .ok_or_else(|| {
                ClusterError::MissingField(format!(
                    "replicaset {} has no pod template",
                    previous.name_any()
                ))
            })?;
        // The hash label belongs to the replica set, not the deployment's
        // template.
        if let Some(labels) = template.metadata.as_mut().and_then(|m| m.labels.as_mut()) {
            labels.remove(POD_TEMPLATE_HASH_LABEL);
        }

        let patch = serde_json::json!({ "spec": { "template": template } });
        self.deployments()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        tracing::info!(
            deployment = name,
            revision,
            "rolled deployment back to previous revision"
        );
        Ok(())
    }

    async fn wait_rollout_complete(&self, name: &str) -> Result<()> {
        loop {
            let deploy = self.deployments().get(name).await?;
            if rollout_complete(&deploy) {
                return Ok(());
            }
            tracing::debug!(deployment = name, "rollout still progressing");
            tokio::time::sleep(ROLLOUT_WAIT_INTERVAL).await;
        }
    }
}
