//! ModelClient port: abstract LLM access.
//!
//! Tiers are resolved to a concrete provider/model elsewhere; the core never
//! depends on a specific provider.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{ModelError, TokenUsage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Small,
    #[default]
    Medium,
    Large,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Tier::Small => "small",
            Tier::Medium => "medium",
            Tier::Large => "large",
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Ask the provider for a JSON object.
    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub content: String,
    pub tokens_used: TokenUsage,
    pub processing_time_ms: u64,
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn call(
        &self,
        tier: Tier,
        prompt: &str,
        system_prompt: Option<&str>,
        options: &CallOptions,
    ) -> Result<ModelResponse, ModelError>;
}
