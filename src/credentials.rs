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

//! Credential file setup.
//!
//! CI environments hand the tool a kubeconfig as an environment variable
//! rather than a file. This runs once, before any cluster call.

use std::path::{Path, PathBuf};

use anyhow::Context;

/// Environment variable holding a kubeconfig blob.
pub const KUBECONFIG_ENV: &str = "KUBECTL_CONFIG";

/// Writes the kubeconfig blob from [`KUBECONFIG_ENV`], if set, to
/// `$HOME/.kube/config`. Returns the path written, or `None` when the
/// variable is absent or empty.
pub async fn write_kubeconfig_from_env() -> anyhow::Result<Option<PathBuf>> {
    let Ok(blob) = std::env::var(KUBECONFIG_ENV) else {
        return Ok(None);
    };
    if blob.is_empty() {
        return Ok(None);
    }

    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/root"));
    let path = write_kubeconfig(&blob, &home).await?;
    tracing::info!(path = %path.display(), "wrote kubeconfig from environment");
    Ok(Some(path))
}

/// Writes a kubeconfig blob under the given home directory.
async fn write_kubeconfig(blob: &str, home: &Path) -> anyhow::Result<PathBuf> {
    let dir = home.join(".kube");
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("failed to create {}", dir.display()))?;

    let path = dir.join("config");
    tokio::fs::write(&path, blob)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
