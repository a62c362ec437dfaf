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

//! Manifest templating.
//!
//! Substitutes `{{ key }}` placeholders with values supplied on the command
//! line. Placeholders with no supplied value are left untouched.

use std::collections::BTreeMap;

use thiserror::Error;

/// Errors from rendering a manifest template.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum TemplateError {
    /// A `{{` with no matching `}}`. Fatal before anything is applied.
    #[error("unterminated placeholder at byte {0}")]
    Unclosed(usize),
}

/// Renders a manifest template against the supplied variables.
pub fn render(template: &str, vars: &BTreeMap<String, String>) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            let position = template.len() - rest.len() + start;
            return Err(TemplateError::Unclosed(position));
        };
        let key = after[..end].trim();
        match vars.get(key) {
            Some(value) => out.push_str(value),
            // Unknown key: leave the placeholder as written.
            None => out.push_str(&rest[start..start + 2 + end + 2]),
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}
