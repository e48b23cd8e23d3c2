use std::collections::HashMap;

use revloop_core::config::ModelConfig;

pub const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// A named provider preset for OpenAI-compatible APIs.
pub struct ProviderPreset {
    pub default_base_url: &'static str,
    pub needs_api_key: bool,
    pub extra_headers: &'static [(&'static str, &'static str)],
}

/// Look up a provider preset by name.
pub fn get_preset(provider: &str) -> Option<ProviderPreset> {
    match provider {
        "groq" => Some(ProviderPreset {
            default_base_url: "https://api.groq.com/openai/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        "ollama" => Some(ProviderPreset {
            default_base_url: "http://localhost:11434/v1/chat/completions",
            needs_api_key: false,
            extra_headers: &[],
        }),
        "openrouter" => Some(ProviderPreset {
            default_base_url: "https://openrouter.ai/api/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[("X-Title", "revloop")],
        }),
        "together" => Some(ProviderPreset {
            default_base_url: "https://api.together.xyz/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        "deepseek" => Some(ProviderPreset {
            default_base_url: "https://api.deepseek.com/v1/chat/completions",
            needs_api_key: true,
            extra_headers: &[],
        }),
        _ => None,
    }
}

/// Build extra headers from a preset + user config overrides.
pub fn build_extra_headers(
    preset: Option<&ProviderPreset>,
    user_headers: &HashMap<String, String>,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = preset
        .map(|p| {
            p.extra_headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    for (k, v) in user_headers {
        // User overrides take precedence
        if let Some(pos) = headers.iter().position(|(hk, _)| hk == k) {
            headers[pos].1 = v.clone();
        } else {
            headers.push((k.clone(), v.clone()));
        }
    }

    headers
}

/// Resolved request target for a model config.
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub needs_api_key: bool,
}

/// Resolve URL and headers: explicit `base_url` wins, then the preset, then OpenAI.
pub fn resolve_endpoint(config: &ModelConfig) -> Endpoint {
    let preset = get_preset(&config.provider);
    let url = config
        .base_url
        .clone()
        .or_else(|| preset.as_ref().map(|p| p.default_base_url.to_string()))
        .unwrap_or_else(|| OPENAI_API_URL.to_string());
    Endpoint {
        url,
        headers: build_extra_headers(preset.as_ref(), &config.extra_headers),
        needs_api_key: preset.as_ref().map(|p| p.needs_api_key).unwrap_or(true),
    }
}
