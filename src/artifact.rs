use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::classify::ApiErrorTitle;
use crate::error::{Error, Result};

/// Terminal classification of one reviewer run, recorded by the runner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunClassification {
    /// The artifact is model output; the parser decides the verdict.
    Ok,
    /// Wall clock expired and salvage produced no JSON; the artifact is the
    /// runner's timeout marker.
    Timeout,
    /// Terminal API failure; the parser synthesizes SKIP / api_error.
    ApiError { title: ApiErrorTitle, detail: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub model_used: String,
    pub primary_model: String,
    pub fallback_used: bool,
    pub runtime_seconds: f64,
    pub attempts: u32,
}

/// One-way handoff from runner to parser: where the selected artifact
/// lives and how the run ended. The parser reads exactly this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactDescriptor {
    pub codename: String,
    pub perspective: String,
    pub artifact_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<PathBuf>,
    pub classification: RunClassification,
    pub metadata: RunMetadata,
}

impl ArtifactDescriptor {
    pub fn descriptor_path(out_dir: &Path, perspective: &str) -> PathBuf {
        out_dir.join(format!("{perspective}.descriptor.json"))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Artifact(format!("failed to serialize descriptor: {e}")))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Artifact(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::Artifact(format!("malformed descriptor {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ArtifactDescriptor {
        ArtifactDescriptor {
            codename: "trace".into(),
            perspective: "correctness".into(),
            artifact_path: PathBuf::from("/out/correctness.review.md"),
            stderr_path: Some(PathBuf::from("/out/correctness.stderr.log")),
            classification: RunClassification::Ok,
            metadata: RunMetadata {
                model_used: "sonnet-4".into(),
                primary_model: "sonnet-4".into(),
                fallback_used: false,
                runtime_seconds: 93.4,
                attempts: 1,
            },
        }
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = ArtifactDescriptor::descriptor_path(dir.path(), "correctness");
        let desc = sample();
        desc.save(&path).unwrap();
        let back = ArtifactDescriptor::load(&path).unwrap();
        assert_eq!(back, desc);
    }

    #[test]
    fn classification_tagged_serde() {
        let c = RunClassification::ApiError {
            title: ApiErrorTitle::ApiCreditsDepleted,
            detail: "insufficient_credits".into(),
        };
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"kind\":\"api_error\""));
        assert!(json.contains("API_CREDITS_DEPLETED"));
        let back: RunClassification = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn load_missing_descriptor_errors() {
        let err = ArtifactDescriptor::load(Path::new("/nonexistent/d.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn load_malformed_descriptor_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("d.json");
        std::fs::write(&path, "{not json").unwrap();
        let err = ArtifactDescriptor::load(&path).unwrap_err();
        assert!(err.to_string().contains("malformed descriptor"));
    }
}
