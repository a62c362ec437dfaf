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

//! Configuration structures for the deploy tool.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Main configuration for kube-deploy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployConfig {
    /// Path to the kubeconfig file. When unset, the client configuration is
    /// inferred from the environment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Master URL to build a client from, overriding the kubeconfig.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<String>,

    /// Namespace the deployment and its pods live in.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Path to the manifest template file.
    #[serde(default = "default_manifest")]
    pub manifest: PathBuf,

    /// Template substitution variables.
    #[serde(default)]
    pub vars: BTreeMap<String, String>,

    /// Health-gate polling configuration.
    #[serde(default)]
    pub poll: PollConfig,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            master: None,
            namespace: default_namespace(),
            manifest: default_manifest(),
            vars: BTreeMap::new(),
            poll: PollConfig::default(),
        }
    }
}

impl DeployConfig {
    /// Parses a configuration from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    /// Validates the configuration, returning a description of the first
    /// problem found.
    pub fn validate(&self) -> Result<(), String> {
        if self.namespace.is_empty() {
            return Err("namespace must not be empty".to_string());
        }
        self.poll.validate()
    }
}

/// Polling parameters for the deployment health gate.
///
/// Owned by the rollout controller for the duration of one deployment's
/// health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollConfig {
    /// Maximum number of health evaluations before the gate times out.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Sleep between health evaluations.
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Sleep between applying the manifest and pausing the rollout, giving
    /// the control plane time to observe the new revision.
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,

    /// Sleep between resuming a rollout and undoing it during rollback.
    #[serde(default = "default_rollback_settle", with = "humantime_serde")]
    pub rollback_settle: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            interval: default_interval(),
            settle_delay: default_settle_delay(),
            rollback_settle: default_rollback_settle(),
        }
    }
}

impl PollConfig {
    /// Validates the polling parameters.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("poll.maxAttempts must be at least 1".to_string());
        }
        if self.interval.is_zero() {
            return Err("poll.interval must be non-zero".to_string());
        }
        Ok(())
    }
}

fn default_namespace() -> String {
    "default".to_string()
}

fn default_manifest() -> PathBuf {
    PathBuf::from("k8s-deployment.yaml")
}

fn default_max_attempts() -> u32 {
    24
}

fn default_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_settle_delay() -> Duration {
    Duration::from_secs(2)
}

fn default_rollback_settle() -> Duration {
    Duration::from_secs(1)
}
