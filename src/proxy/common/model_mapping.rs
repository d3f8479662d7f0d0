// Anthropic model id → CodeWhisperer internal model id.

use serde::Serialize;

pub const MODEL_MAP: &[(&str, &str)] = &[
    ("claude-sonnet-4-20250514", "CLAUDE_SONNET_4_20250514_V1_0"),
    ("claude-3-7-sonnet-20250219", "CLAUDE_3_7_SONNET_20250219_V1_0"),
    ("claude-3-5-sonnet-20241022", "CLAUDE_3_5_SONNET_20241022_V2_0"),
    ("claude-3-5-haiku-20241022", "CLAUDE_3_5_HAIKU_20241022_V1_0"),
];

/// Resolve the upstream model id. Unknown names pass through unchanged and
/// the upstream decides whether it can serve them.
pub fn resolve_model(anthropic_model: &str) -> &str {
    MODEL_MAP
        .iter()
        .find(|(name, _)| *name == anthropic_model)
        .map(|(_, internal)| *internal)
        .unwrap_or(anthropic_model)
}

/// Catalog entry for GET /v1/models.
#[derive(Debug, Clone, Serialize)]
pub struct Model {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
    pub display_name: String,
    #[serde(rename = "type")]
    pub model_type: &'static str,
    pub max_tokens: u32,
}

pub fn model_catalog() -> Vec<Model> {
    MODEL_MAP
        .iter()
        .map(|(name, _)| Model {
            id: name.to_string(),
            object: "model",
            created: 1234567890,
            owned_by: "anthropic",
            display_name: name.to_string(),
            model_type: "text",
            max_tokens: 200_000,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_model() {
        assert_eq!(
            resolve_model("claude-sonnet-4-20250514"),
            "CLAUDE_SONNET_4_20250514_V1_0"
        );
    }

    #[test]
    fn test_resolve_unknown_model_passes_through() {
        assert_eq!(resolve_model("claude-future-9"), "claude-future-9");
    }

    #[test]
    fn test_catalog_matches_map() {
        let catalog = model_catalog();
        assert_eq!(catalog.len(), MODEL_MAP.len());
        assert!(catalog.iter().all(|m| m.object == "model"));
        assert!(catalog.iter().any(|m| m.id == "claude-3-5-haiku-20241022"));
    }
}
