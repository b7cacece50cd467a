//! Server-side relay that holds the upstream credential.
//!
//! Accepts the JSON edit request the orchestrator sends, decodes both data
//! URIs and forwards them to the upstream image-edit endpoint as multipart.
//! Upstream JSON comes back unchanged; failures are translated into
//! `{"error": ..}` bodies.

use maskmagic_contracts::config::{Endpoint, RelayConfig};
use maskmagic_contracts::wire::{decode_data_uri, DataUri, EditRequestBody};
use serde_json::{json, Value};

use crate::transport::{HttpTransport, MultipartUpload};

const PNG_MIME: &str = "image/png";

pub const RELAY_CORS_HEADERS: &[(&str, &str)] = &[
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "POST, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct RelayReply {
    pub status: u16,
    pub body: Option<Value>,
}

impl RelayReply {
    fn empty(status: u16) -> Self {
        Self { status, body: None }
    }

    fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    fn error(status: u16, message: &str) -> Self {
        Self::json(status, json!({ "error": message }))
    }

    pub fn headers(&self) -> &'static [(&'static str, &'static str)] {
        RELAY_CORS_HEADERS
    }
}

pub struct Relay {
    config: RelayConfig,
    transport: Box<dyn HttpTransport>,
}

impl Relay {
    pub fn new(config: RelayConfig, transport: impl HttpTransport + 'static) -> Self {
        Self {
            config,
            transport: Box::new(transport),
        }
    }

    pub fn handle(&self, method: &str, body: &[u8]) -> RelayReply {
        if method.eq_ignore_ascii_case("OPTIONS") {
            return RelayReply::empty(204);
        }
        if !method.eq_ignore_ascii_case("POST") {
            return RelayReply::error(405, "Method not allowed");
        }

        let request: EditRequestBody = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(err) => {
                tracing::warn!("rejecting relay request: {err}");
                return RelayReply::error(400, "Invalid JSON body");
            }
        };
        tracing::info!(
            has_image = !request.image.is_empty(),
            has_mask = !request.mask.is_empty(),
            prompt_length = request.prompt.len(),
            "received relay request"
        );
        if !request.has_required_fields() {
            return RelayReply::error(400, "Missing required parameters");
        }

        let Some(api_key) = self.config.api_key.as_deref() else {
            tracing::error!("upstream API key is not configured");
            return RelayReply::error(500, "Server configuration error");
        };

        let (image, mask) = match decode_pair(&request) {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!("rejecting relay request: {err:#}");
                return RelayReply::error(
                    400,
                    "Invalid image format. Must be data URI with base64 encoding.",
                );
            }
        };
        tracing::debug!(
            image_type = %image.mime,
            image_bytes = image.bytes.len(),
            mask_type = %mask.mime,
            mask_bytes = mask.bytes.len(),
            "decoded data URIs"
        );

        let upload = MultipartUpload::default()
            .file("image", "image.png", &image.mime, image.bytes)
            .file("mask", "mask.png", &mask.mime, mask.bytes)
            .text("prompt", request.prompt.as_str())
            .text("model", request.model.as_str())
            .text("size", request.size.as_str())
            .text("response_format", request.response_format.as_str());
        let endpoint = Endpoint::bearer(self.config.edits_url(), api_key);
        tracing::info!(model = %request.model, size = %request.size, "calling upstream edits");

        let reply = match self.transport.post_multipart(&endpoint, upload) {
            Ok(reply) => reply,
            Err(err) => {
                tracing::error!("upstream request failed: {err}");
                return RelayReply::error(500, "Failed to generate image");
            }
        };

        if reply.is_success() {
            return match reply.json() {
                Some(body) => {
                    tracing::info!(status = reply.status, "upstream success");
                    RelayReply::json(200, body)
                }
                None => {
                    tracing::error!(status = reply.status, "upstream returned a non-JSON body");
                    RelayReply::error(500, "Failed to generate image")
                }
            };
        }

        let details = reply.json().unwrap_or_else(|| Value::String(reply.text()));
        tracing::error!(status = reply.status, %details, "upstream error");
        RelayReply::json(
            reply.status,
            json!({ "error": "OpenAI API error", "details": details }),
        )
    }
}

/// Decodes both data URIs. The upstream edits endpoint only takes PNG.
fn decode_pair(request: &EditRequestBody) -> anyhow::Result<(DataUri, DataUri)> {
    let image = decode_data_uri(&request.image)?;
    let mask = decode_data_uri(&request.mask)?;
    for (part, uri) in [("image", &image), ("mask", &mask)] {
        anyhow::ensure!(uri.mime == PNG_MIME, "{part} is {}, expected {PNG_MIME}", uri.mime);
    }
    Ok((image, mask))
}
