use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::{DEFAULT_CANVAS_SIZE, DEFAULT_MODEL, DEFAULT_RESPONSE_FORMAT};

/// JSON body posted to the generation backend.
///
/// `image`, `mask` and `prompt` default to empty so the relay can tell a missing
/// field apart from a malformed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditRequestBody {
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub mask: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_size")]
    pub size: String,
    #[serde(default = "default_response_format")]
    pub response_format: String,
}

impl EditRequestBody {
    pub fn has_required_fields(&self) -> bool {
        !self.image.is_empty() && !self.mask.is_empty() && !self.prompt.is_empty()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "image": self.image,
            "mask": self.mask,
            "prompt": self.prompt,
            "model": self.model,
            "size": self.size,
            "response_format": self.response_format,
        })
    }
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_size() -> String {
    format!("{0}x{0}", DEFAULT_CANVAS_SIZE)
}

fn default_response_format() -> String {
    DEFAULT_RESPONSE_FORMAT.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditResponseBody {
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub data: Vec<EditResponseItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditResponseItem {
    #[serde(default)]
    pub url: Option<String>,
}

impl EditResponseBody {
    pub fn first_url(&self) -> Option<&str> {
        self.data
            .first()
            .and_then(|item| item.url.as_deref())
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// Pulls a human-readable message out of an error body.
///
/// Understands `{"error":{"message":..}}` and the relay's translated form
/// `{"error":"..","details":{"error":{"message":..}}}`.
pub fn error_message(body: &[u8]) -> Option<String> {
    let parsed: Value = serde_json::from_slice(body).ok()?;
    let direct = parsed
        .get("error")
        .and_then(|error| error.get("message"))
        .and_then(Value::as_str);
    let relayed = || {
        parsed
            .get("details")
            .and_then(|details| details.get("error"))
            .and_then(|error| error.get("message"))
            .and_then(Value::as_str)
    };
    direct
        .or_else(relayed)
        .map(str::trim)
        .filter(|message| !message.is_empty())
        .map(str::to_string)
}

pub fn generic_status_message(status_code: u16) -> String {
    format!("API error with status code: {status_code}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUri {
    pub mime: String,
    pub bytes: Vec<u8>,
}

pub fn encode_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

pub fn decode_data_uri(uri: &str) -> anyhow::Result<DataUri> {
    let Some(rest) = uri.strip_prefix("data:") else {
        bail!("data URI must start with 'data:'");
    };
    let Some((mime, payload)) = rest.split_once(";base64,") else {
        bail!("data URI must declare base64 encoding");
    };
    let mime_ok = !mime.is_empty()
        && mime
            .chars()
            .all(|c| c.is_ascii_alphabetic() || matches!(c, '-' | '+' | '/'));
    if !mime_ok {
        bail!("invalid data URI content type '{mime}'");
    }
    if payload.is_empty() {
        bail!("data URI payload is empty");
    }
    let bytes = BASE64
        .decode(payload.as_bytes())
        .context("data URI payload is not valid base64")?;
    Ok(DataUri {
        mime: mime.to_string(),
        bytes,
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn request_body_serializes_wire_field_names() -> anyhow::Result<()> {
        let body = EditRequestBody {
            image: "data:image/png;base64,AAAA".to_string(),
            mask: "data:image/png;base64,BBBB".to_string(),
            prompt: "add a hat".to_string(),
            model: "dall-e-2".to_string(),
            size: "1024x1024".to_string(),
            response_format: "url".to_string(),
        };
        let value = serde_json::to_value(&body)?;
        assert_eq!(value, body.to_json());
        assert_eq!(
            value,
            json!({
                "image": "data:image/png;base64,AAAA",
                "mask": "data:image/png;base64,BBBB",
                "prompt": "add a hat",
                "model": "dall-e-2",
                "size": "1024x1024",
                "response_format": "url",
            })
        );
        Ok(())
    }

    #[test]
    fn request_body_defaults_optional_fields() -> anyhow::Result<()> {
        let body: EditRequestBody = serde_json::from_value(json!({"prompt": "cat"}))?;
        assert_eq!(body.model, "dall-e-2");
        assert_eq!(body.size, "1024x1024");
        assert_eq!(body.response_format, "url");
        assert!(!body.has_required_fields());
        Ok(())
    }

    #[test]
    fn response_first_url_skips_null_and_blank() -> anyhow::Result<()> {
        let ok: EditResponseBody =
            serde_json::from_value(json!({"created": 1, "data": [{"url": "https://x/img.png"}]}))?;
        assert_eq!(ok.first_url(), Some("https://x/img.png"));

        let null: EditResponseBody =
            serde_json::from_value(json!({"created": 1, "data": [{"url": null}]}))?;
        assert_eq!(null.first_url(), None);

        let empty: EditResponseBody = serde_json::from_value(json!({"created": 1, "data": []}))?;
        assert_eq!(empty.first_url(), None);
        Ok(())
    }

    #[test]
    fn error_message_prefers_structured_field() {
        assert_eq!(
            error_message(br#"{"error":{"message":"rate limited"}}"#).as_deref(),
            Some("rate limited")
        );
        assert_eq!(
            error_message(
                br#"{"error":"OpenAI API error","details":{"error":{"message":"bad mask"}}}"#
            )
            .as_deref(),
            Some("bad mask")
        );
        assert_eq!(error_message(br#"{"error":"Server configuration error"}"#), None);
        assert_eq!(error_message(b"<html>oops</html>"), None);
        assert_eq!(generic_status_message(502), "API error with status code: 502");
    }

    #[test]
    fn data_uri_decodes_payload() -> anyhow::Result<()> {
        let uri = encode_data_uri("image/png", b"\x89PNG");
        assert!(uri.starts_with("data:image/png;base64,"));
        let decoded = decode_data_uri(&uri)?;
        assert_eq!(decoded.mime, "image/png");
        assert_eq!(decoded.bytes, b"\x89PNG".to_vec());
        Ok(())
    }

    #[test]
    fn data_uri_rejects_malformed_input() {
        assert!(decode_data_uri("image/png;base64,AAAA").is_err());
        assert!(decode_data_uri("data:image/png,AAAA").is_err());
        assert!(decode_data_uri("data:image png;base64,AAAA").is_err());
        assert!(decode_data_uri("data:image/png;base64,").is_err());
        assert!(decode_data_uri("data:image/png;base64,@@@").is_err());
    }
}
