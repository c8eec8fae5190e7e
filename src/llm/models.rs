//! Failover rosters: the ordered list of configured models for the active
//! provider backend, plus selection-index clamping.

use crate::config::Config;
use tracing::warn;
use url::Url;

/// Which OpenAI-compatible endpoint serves the roster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    OpenRouter,
    Ollama { base_url: String },
}

impl Backend {
    /// Full chat-completions URL for this backend.
    pub fn completions_url(&self) -> String {
        match self {
            Backend::OpenRouter => "https://openrouter.ai/api/v1/chat/completions".to_string(),
            Backend::Ollama { base_url } => {
                format!("{}/chat/completions", base_url.trim_end_matches('/'))
            }
        }
    }

    /// Ollama runs locally and ignores authorization.
    pub fn needs_api_key(&self) -> bool {
        matches!(self, Backend::OpenRouter)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Backend::OpenRouter => "OpenRouter",
            Backend::Ollama { .. } => "Ollama",
        }
    }
}

/// One configured model: provider id plus the display name used in
/// notifications and timing footers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
}

/// The ordered failover roster for the active backend.
#[derive(Debug, Clone)]
pub struct Roster {
    backend: Backend,
    entries: Vec<ModelEntry>,
}

impl Roster {
    /// Build the active roster from config: blank entries are dropped and
    /// the id/name lists are zipped, truncating to the shorter one.
    pub fn from_config(config: &Config) -> Self {
        let (models, names, backend) = if config.use_ollama {
            let base_url = match Url::parse(&config.ollama_base_url) {
                Ok(url) => url.to_string().trim_end_matches('/').to_string(),
                Err(err) => {
                    warn!(
                        "invalid ollama_base_url {:?} ({}), falling back to default",
                        config.ollama_base_url, err
                    );
                    "http://localhost:11434/v1".to_string()
                }
            };
            (
                &config.ollama_models,
                &config.ollama_model_names,
                Backend::Ollama { base_url },
            )
        } else {
            (
                &config.openrouter_models,
                &config.openrouter_model_names,
                Backend::OpenRouter,
            )
        };

        let models: Vec<&str> = models
            .iter()
            .map(|m| m.trim())
            .filter(|m| !m.is_empty())
            .collect();
        let names: Vec<&str> = names
            .iter()
            .map(|n| n.trim())
            .filter(|n| !n.is_empty())
            .collect();

        let cutoff = models.len().min(names.len());
        let entries = models[..cutoff]
            .iter()
            .zip(&names[..cutoff])
            .map(|(id, name)| ModelEntry {
                id: id.to_string(),
                name: name.to_string(),
            })
            .collect();

        Self { backend, entries }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> &ModelEntry {
        &self.entries[index]
    }

    pub fn entries(&self) -> &[ModelEntry] {
        &self.entries
    }

    /// Clamp a selection index into `[0, len - 1]`. Zero for an empty roster.
    pub fn clamp_index(&self, index: usize) -> usize {
        if self.entries.is_empty() {
            0
        } else {
            index.min(self.entries.len() - 1)
        }
    }
}
