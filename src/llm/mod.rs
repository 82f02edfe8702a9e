//! Text-generation providers used by the brief extractor.
//!
//! Each provider exposes the same `generate(prompt) -> text` contract so the
//! extractor can cascade through them in configured order.

mod error;
mod gemini;
mod openai;

pub use error::{classify_http_status, ProviderError, ProviderErrorKind};
pub use gemini::GeminiProvider;
pub use openai::OpenAiCompatibleProvider;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::ProviderConfig;

/// A text-generation service.
#[async_trait]
pub trait TextProvider: Send + Sync {
    /// Provider name for logging ("openai", "gemini", ...).
    fn name(&self) -> &str;

    /// Generate a completion for a single prompt.
    async fn generate(&self, prompt: &str) -> Result<String, ProviderError>;
}

pub type ProviderRef = Arc<dyn TextProvider>;

/// Build providers from configuration, preserving cascade order.
pub fn providers_from_config(configs: &[ProviderConfig]) -> Vec<ProviderRef> {
    configs
        .iter()
        .map(|cfg| -> ProviderRef {
            match cfg.name.as_str() {
                "gemini" => Arc::new(GeminiProvider::new(cfg.api_key.clone(), cfg.model.clone())),
                "venice" => Arc::new(OpenAiCompatibleProvider::venice(
                    cfg.api_key.clone(),
                    cfg.model.clone(),
                    cfg.base_url.clone(),
                )),
                _ => Arc::new(OpenAiCompatibleProvider::openai(
                    cfg.api_key.clone(),
                    cfg.model.clone(),
                )),
            }
        })
        .collect()
}
