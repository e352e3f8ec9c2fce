//! Discovery prompts answered by the sidecar runtime

use async_trait::async_trait;
use pulse_core::Result;
use pulse_discovery::Analyzer;
use pulse_llm::{PromptRequest, Sidecar};
use std::sync::Arc;

pub struct SidecarAnalyzer {
    sidecar: Arc<Sidecar>,
    model: String,
}

impl SidecarAnalyzer {
    pub fn new(sidecar: Arc<Sidecar>, model: impl Into<String>) -> Self {
        Self {
            sidecar,
            model: model.into(),
        }
    }
}

#[async_trait]
impl Analyzer for SidecarAnalyzer {
    async fn analyze(&self, prompt: &str) -> Result<String> {
        let client = self.sidecar.client().await?;
        let mut request = PromptRequest::new(prompt);
        if !self.model.is_empty() {
            request = request.with_model(self.model.clone());
        }
        let response = client.prompt(&request).await?;
        Ok(response.message.content)
    }
}
