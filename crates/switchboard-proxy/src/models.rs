//! JSON shapes the adapter layer speaks, independent of what a backend's
//! own request/response bodies look like. The router only ever needs the
//! `model` field out of an inbound body; everything else is forwarded
//! to the backend byte-for-byte.

use bytes::Bytes;
use serde::Serialize;
use switchboard_core::CoreError;
use switchboard_runtime::CatalogEntry;

/// Pull the `model` field out of a request body without otherwise
/// interpreting it. Mirrors the OpenAI and Ollama request shapes, both of
/// which carry the model name as a top-level JSON string field.
pub fn extract_model_name(body: &Bytes) -> Result<String, CoreError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| CoreError::InvalidRequest(format!("malformed JSON body: {e}")))?;
    value
        .get("model")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| CoreError::InvalidRequest("request body is missing a `model` field".into()))
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

impl ModelsResponse {
    #[must_use]
    pub fn from_catalog(entries: Vec<CatalogEntry>) -> Self {
        Self {
            object: "list",
            data: entries
                .into_iter()
                .map(|e| ModelInfo {
                    id: e.name,
                    object: "model",
                    created: 0,
                    owned_by: "switchboard",
                    aliases: e.aliases,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: &'static str,
}

impl From<&CoreError> for ErrorResponse {
    fn from(err: &CoreError) -> Self {
        Self {
            error: ErrorDetail {
                message: err.to_string(),
                r#type: err.kind(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_model_name_reads_top_level_field() {
        let body = Bytes::from(r#"{"model":"llama3","messages":[]}"#);
        assert_eq!(extract_model_name(&body).unwrap(), "llama3");
    }

    #[test]
    fn extract_model_name_rejects_missing_field() {
        let body = Bytes::from(r#"{"messages":[]}"#);
        let err = extract_model_name(&body).unwrap_err();
        assert_eq!(err.kind(), "invalid-request");
    }

    #[test]
    fn extract_model_name_rejects_malformed_json() {
        let body = Bytes::from("not json");
        let err = extract_model_name(&body).unwrap_err();
        assert_eq!(err.kind(), "invalid-request");
    }

    #[test]
    fn catalog_conversion_preserves_aliases() {
        let entries = vec![CatalogEntry {
            name: "llama3".into(),
            aliases: vec!["gpt-4".into()],
        }];
        let response = ModelsResponse::from_catalog(entries);
        assert_eq!(response.data[0].id, "llama3");
        assert_eq!(response.data[0].aliases, vec!["gpt-4".to_string()]);
    }
}
