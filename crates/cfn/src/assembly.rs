//! The cloud assembly: templates plus the manifest the deployment engine reads.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use crate::error::CfnError;

/// Schema version written to `manifest.json`.
pub const MANIFEST_VERSION: &str = "36.0.0";

/// Name of the manifest file inside the assembly directory.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Top-level assembly manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub artifacts: BTreeMap<String, ArtifactManifest>,
}

/// One stack entry of the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    #[serde(rename = "type")]
    pub artifact_type: String,
    /// `aws://account/region`.
    pub environment: String,
    pub properties: ArtifactProperties,
    /// Artifact ids that must be deployed first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// Deployment properties of a stack artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactProperties {
    #[serde(rename = "templateFile")]
    pub template_file: String,
    #[serde(rename = "stackName")]
    pub stack_name: String,
}

/// Everything produced by one synthesis pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CloudAssembly {
    pub manifest: Manifest,
    /// Rendered templates keyed by artifact id.
    pub templates: BTreeMap<String, Value>,
    /// Artifact ids in a valid deployment order.
    pub deployment_order: Vec<String>,
}

impl CloudAssembly {
    /// File name of the template for an artifact.
    #[must_use]
    pub fn template_file_name(artifact_id: &str) -> String {
        format!("{artifact_id}.template.json")
    }

    /// Template of one stack.
    #[must_use]
    pub fn template(&self, artifact_id: &str) -> Option<&Value> {
        self.templates.get(artifact_id)
    }

    /// Render every file of the assembly, keyed by file name.
    ///
    /// Keys are emitted in sorted order, so identical input always renders
    /// to identical bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if a template cannot be serialized.
    pub fn files(&self) -> Result<BTreeMap<String, String>, CfnError> {
        let mut files = BTreeMap::new();
        for (artifact_id, template) in &self.templates {
            let mut body = serde_json::to_string_pretty(template)?;
            body.push('\n');
            files.insert(Self::template_file_name(artifact_id), body);
        }
        let mut manifest = serde_json::to_string_pretty(&self.manifest)?;
        manifest.push('\n');
        files.insert(MANIFEST_FILE.to_string(), manifest);
        Ok(files)
    }

    /// Write the assembly into `dir`, creating it if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or a file cannot be written.
    pub fn write_to(&self, dir: impl AsRef<Path>) -> Result<(), CfnError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        for (name, body) in self.files()? {
            fs::write(dir.join(&name), body)?;
        }
        info!(
            "Wrote {} stack template(s) to {}",
            self.templates.len(),
            dir.display()
        );
        Ok(())
    }
}
