//! Prompt texts for each inference stage.
//!
//! A [`PromptSet`] is assembled once per run, from the built-in defaults
//! optionally overridden by files in a prompts directory:
//!
//! | Stage | File |
//! |---|---|
//! | caption | `caption.txt` |
//! | moderation | `moderation.txt` |
//! | explanation | `explanation.txt` |
//! | age estimation | `age_estimation_from_caption.txt` |

pub mod defaults;

use std::path::Path;

/// Suffix that disables Qwen3's thinking mode for text-only requests.
const NO_THINK_SUFFIX: &str = "/no_think";

/// The prompts used by a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptSet {
    pub caption: String,
    pub moderation: String,
    pub explanation: String,
    pub age_estimation: String,
}

impl Default for PromptSet {
    fn default() -> Self {
        Self {
            caption: defaults::CAPTION_PROMPT.to_string(),
            moderation: defaults::MODERATION_PROMPT.to_string(),
            explanation: defaults::EXPLANATION_PROMPT.to_string(),
            age_estimation: defaults::AGE_ESTIMATION_PROMPT.to_string(),
        }
    }
}

impl PromptSet {
    /// Loads prompts from `dir`, falling back to the default for every file
    /// that does not exist. Other read errors are returned.
    pub fn load(dir: &Path) -> std::io::Result<Self> {
        let defaults = Self::default();
        let set = Self {
            caption: read_or(dir, "caption.txt", defaults.caption)?,
            moderation: read_or(dir, "moderation.txt", defaults.moderation)?,
            explanation: read_or(dir, "explanation.txt", defaults.explanation)?,
            age_estimation: read_or(dir, "age_estimation_from_caption.txt", defaults.age_estimation)?,
        };
        tracing::debug!(dir = %dir.display(), "Loaded prompt set");
        Ok(set)
    }

    /// The age estimation request for one caption.
    pub fn age_estimation_for_caption(&self, caption: &str) -> String {
        format!(
            "{}\n\nCaption:\n{}\n\n{}\n",
            self.age_estimation, caption, NO_THINK_SUFFIX
        )
    }
}

fn read_or(dir: &Path, name: &str, fallback: String) -> std::io::Result<String> {
    match std::fs::read_to_string(dir.join(name)) {
        Ok(text) => Ok(text.trim().to_string()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(fallback),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_overrides_present_files_only() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("caption.txt"), "  Caption this.\n").unwrap();

        let prompts = PromptSet::load(dir.path()).unwrap();
        assert_eq!(prompts.caption, "Caption this.");
        assert_eq!(prompts.moderation, defaults::MODERATION_PROMPT);
        assert_eq!(prompts.age_estimation, defaults::AGE_ESTIMATION_PROMPT);
    }

    #[test]
    fn test_age_estimation_embeds_caption() {
        let prompts = PromptSet {
            age_estimation: "Estimate.".to_string(),
            ..PromptSet::default()
        };
        assert_eq!(
            prompts.age_estimation_for_caption("A girl in a park."),
            "Estimate.\n\nCaption:\nA girl in a park.\n\n/no_think\n"
        );
    }

    #[test]
    fn test_default_moderation_prompt_requests_bracketed_rating() {
        assert!(PromptSet::default().moderation.contains("[["));
    }
}
