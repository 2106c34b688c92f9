//! Model registry.
//!
//! Describes the GGUF models the worker can serve through llama.cpp and where
//! their files live on disk. The registry is built once and shared read-only
//! by everything that needs model metadata.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::RegistryError;
use crate::storage::RecordMetadata;

/// Backend identifier recorded in result metadata.
pub const LLAMA_CPP_BACKEND: &str = "llama.cpp";

/// A servable model: a language GGUF and, for vision models, a projector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Short key used in result slots and on the command line.
    pub key: String,
    /// Human-readable name recorded in result metadata.
    pub name: String,
    pub backend: String,
    pub language_repository: String,
    pub language_file: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_repository: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision_file: Option<String>,
}

impl ModelSpec {
    fn text(key: &str, name: &str, repository: &str, file: &str) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            backend: LLAMA_CPP_BACKEND.to_string(),
            language_repository: repository.to_string(),
            language_file: file.to_string(),
            vision_repository: None,
            vision_file: None,
        }
    }

    fn with_vision(mut self, repository: &str, file: &str) -> Self {
        self.vision_repository = Some(repository.to_string());
        self.vision_file = Some(file.to_string());
        self
    }

    pub fn is_multimodal(&self) -> bool {
        self.vision_file.is_some()
    }

    /// Metadata block for a result produced by this model with `prompt`.
    pub fn record_metadata(&self, prompt: &str) -> RecordMetadata {
        RecordMetadata {
            model: self.name.clone(),
            backend: self.backend.clone(),
            language_repository: Some(self.language_repository.clone()),
            vision_repository: self.vision_repository.clone(),
            language_file: Some(self.language_file.clone()),
            vision_file: self.vision_file.clone(),
            prompt: prompt.to_string(),
            caption_source: None,
            created_at: Utc::now(),
        }
    }
}

/// Resolved on-disk model files passed to the inference server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    pub language: PathBuf,
    pub vision: Option<PathBuf>,
}

/// Read-only table of known models.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: BTreeMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ModelRegistry {
    /// The models the worker ships support for.
    pub fn builtin() -> Self {
        Self::from_specs([
            ModelSpec::text(
                "minicpm",
                "Huihui MiniCPM-V 4.5 Abliterated (F16)",
                "huihui-ai/Huihui-MiniCPM-V-4_5-abliterated",
                "GGUF/ggml-model-f16.gguf",
            )
            .with_vision(
                "huihui-ai/Huihui-MiniCPM-V-4_5-abliterated",
                "GGUF/mmproj-model-f16.gguf",
            ),
            ModelSpec::text(
                "joycaption",
                "JoyCaption Beta One (Llava F16)",
                "concedo/llama-joycaption-beta-one-hf-llava-mmproj-gguf",
                "Llama-Joycaption-Beta-One-Hf-Llava-F16.gguf",
            )
            .with_vision(
                "concedo/llama-joycaption-beta-one-hf-llava-mmproj-gguf",
                "llama-joycaption-beta-one-llava-mmproj-model-f16.gguf",
            ),
            ModelSpec::text(
                "qwen3",
                "Qwen3-32B (Q6_K)",
                "Qwen/Qwen3-32B-GGUF",
                "Qwen3-32B-Q6_K.gguf",
            ),
        ])
    }

    pub fn from_specs(specs: impl IntoIterator<Item = ModelSpec>) -> Self {
        Self {
            models: specs
                .into_iter()
                .map(|spec| (spec.key.clone(), spec))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Result<&ModelSpec, RegistryError> {
        self.models
            .get(key)
            .ok_or_else(|| RegistryError::UnknownModel(key.to_string()))
    }

    /// Looks up a model that can see images.
    pub fn get_multimodal(&self, key: &str) -> Result<&ModelSpec, RegistryError> {
        let spec = self.get(key)?;
        if !spec.is_multimodal() {
            return Err(RegistryError::NotMultimodal {
                model: key.to_string(),
            });
        }
        Ok(spec)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.models.keys().map(String::as_str)
    }

    /// Resolves model files as `<models_dir>/<repository>/<file>` and checks
    /// that they exist.
    pub fn resolve_files(&self, key: &str, models_dir: &Path) -> Result<ModelFiles, RegistryError> {
        let spec = self.get(key)?;
        let language = existing_file(
            key,
            models_dir
                .join(&spec.language_repository)
                .join(&spec.language_file),
        )?;
        let vision = match (&spec.vision_repository, &spec.vision_file) {
            (Some(repository), Some(file)) => {
                Some(existing_file(key, models_dir.join(repository).join(file))?)
            }
            _ => None,
        };
        Ok(ModelFiles { language, vision })
    }
}

fn existing_file(model: &str, path: PathBuf) -> Result<PathBuf, RegistryError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(RegistryError::MissingModelFile {
            model: model.to_string(),
            path,
        })
    }
}
