//! The HTTP seam between the pipeline and the outside world.

use std::time::Duration;

use maskmagic_contracts::config::{AuthStrategy, Endpoint};
use reqwest::blocking::multipart::{Form as MultipartForm, Part as MultipartPart};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;

use crate::error::{PipelineError, Result};

/// A terminal HTTP response, whatever its status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub field: String,
    pub file_name: String,
    pub mime: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartUpload {
    pub files: Vec<UploadFile>,
    pub fields: Vec<(String, String)>,
}

impl MultipartUpload {
    pub fn file(
        mut self,
        field: impl Into<String>,
        file_name: impl Into<String>,
        mime: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        self.files.push(UploadFile {
            field: field.into(),
            file_name: file_name.into(),
            mime: mime.into(),
            bytes,
        });
        self
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push((name.into(), value.into()));
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Blocks until a terminal response arrives. Non-2xx statuses are replies,
/// not errors; only failures to complete the exchange become
/// [`PipelineError::TransportError`].
pub trait HttpTransport: Send + Sync {
    fn post_json(&self, endpoint: &Endpoint, payload: &Value) -> Result<HttpReply>;

    fn post_multipart(&self, endpoint: &Endpoint, upload: MultipartUpload) -> Result<HttpReply>;

    fn get(&self, url: &str) -> Result<HttpReply>;
}

#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: HttpClient,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = HttpClient::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| transport_error("failed to build HTTP client", err))?;
        Ok(Self { http })
    }

    fn authorize(request: RequestBuilder, auth: &AuthStrategy) -> RequestBuilder {
        match auth {
            AuthStrategy::None => request,
            AuthStrategy::Bearer { token } => request.bearer_auth(token),
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn post_json(&self, endpoint: &Endpoint, payload: &Value) -> Result<HttpReply> {
        tracing::debug!(url = %endpoint.url, "POST json");
        let request = Self::authorize(self.http.post(&endpoint.url), &endpoint.auth).json(payload);
        let response = request
            .send()
            .map_err(|err| transport_error(&format!("request failed ({})", endpoint.url), err))?;
        read_reply(response)
    }

    fn post_multipart(&self, endpoint: &Endpoint, upload: MultipartUpload) -> Result<HttpReply> {
        tracing::debug!(
            url = %endpoint.url,
            files = upload.files.len(),
            fields = upload.fields.len(),
            "POST multipart"
        );
        let mut form = MultipartForm::new();
        for (name, value) in upload.fields {
            form = form.text(name, value);
        }
        for file in upload.files {
            let part = MultipartPart::bytes(file.bytes)
                .file_name(file.file_name)
                .mime_str(&file.mime)
                .map_err(|err| transport_error(&format!("invalid mime '{}'", file.mime), err))?;
            form = form.part(file.field, part);
        }
        let request =
            Self::authorize(self.http.post(&endpoint.url), &endpoint.auth).multipart(form);
        let response = request
            .send()
            .map_err(|err| transport_error(&format!("request failed ({})", endpoint.url), err))?;
        read_reply(response)
    }

    fn get(&self, url: &str) -> Result<HttpReply> {
        tracing::debug!(url, "GET");
        let response = self
            .http
            .get(url)
            .send()
            .map_err(|err| transport_error(&format!("download failed ({url})"), err))?;
        read_reply(response)
    }
}

fn read_reply(response: HttpResponse) -> Result<HttpReply> {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = response
        .bytes()
        .map_err(|err| transport_error("failed reading response body", err))?
        .to_vec();
    tracing::debug!(status, bytes = body.len(), "response received");
    Ok(HttpReply {
        status,
        content_type,
        body,
    })
}

fn transport_error(context: &str, err: reqwest::Error) -> PipelineError {
    let kind = if err.is_timeout() {
        "timed out"
    } else if err.is_connect() {
        "connection failed"
    } else {
        "request error"
    };
    PipelineError::TransportError(format!("{context}: {kind}: {err}"))
}


#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    use serde_json::json;

    use super::*;

    /// Accepts one connection, captures the full request and answers with `reply`.
    fn one_shot_server(
        status_line: &'static str,
        content_type: &'static str,
        reply: &'static [u8],
    ) -> anyhow::Result<(String, thread::JoinHandle<String>)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().expect("accept failed");
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let read = stream.read(&mut buf).expect("read failed");
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..read]);
                if request_complete(&request) {
                    break;
                }
            }
            let head = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                reply.len()
            );
            stream.write_all(head.as_bytes()).expect("write headers failed");
            stream.write_all(reply).expect("write body failed");
            stream.flush().expect("flush failed");
            String::from_utf8_lossy(&request).into_owned()
        });
        Ok((format!("http://{addr}"), server))
    }

    fn request_complete(request: &[u8]) -> bool {
        let Some(header_end) = request.windows(4).position(|window| window == b"\r\n\r\n") else {
            return false;
        };
        let head = String::from_utf8_lossy(&request[..header_end]).to_ascii_lowercase();
        let content_length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|value| value.trim().parse::<usize>().ok())
            .unwrap_or(0);
        request.len() >= header_end + 4 + content_length
    }

    #[test]
    fn post_json_sends_bearer_and_returns_error_replies() -> anyhow::Result<()> {
        let (base, server) = one_shot_server(
            "500 Internal Server Error",
            "application/json",
            br#"{"error":{"message":"rate limited"}}"#,
        )?;
        let transport = ReqwestTransport::new(Duration::from_secs(10))?;
        let endpoint = Endpoint::bearer(format!("{base}/generateImage"), "secret-token");
        let reply = transport.post_json(&endpoint, &json!({"prompt": "add a hat"}))?;
        let request = server.join().expect("server thread failed");

        assert_eq!(reply.status, 500);
        assert!(!reply.is_success());
        assert_eq!(reply.content_type.as_deref(), Some("application/json"));
        assert_eq!(
            reply.json(),
            Some(json!({"error": {"message": "rate limited"}}))
        );
        assert!(request.starts_with("POST /generateImage HTTP/1.1"));
        assert!(request
            .to_ascii_lowercase()
            .contains("authorization: bearer secret-token"));
        assert!(request.contains(r#"{"prompt":"add a hat"}"#));
        Ok(())
    }

    #[test]
    fn multipart_upload_carries_files_and_fields() -> anyhow::Result<()> {
        let (base, server) = one_shot_server("200 OK", "application/json", br#"{"created":1}"#)?;
        let transport = ReqwestTransport::new(Duration::from_secs(10))?;
        let upload = MultipartUpload::default()
            .file("image", "image.png", "image/png", b"PNGDATA".to_vec())
            .text("model", "dall-e-2");
        assert_eq!(upload.field("model"), Some("dall-e-2"));

        let reply = transport.post_multipart(&Endpoint::anonymous(format!("{base}/edits")), upload)?;
        let request = server.join().expect("server thread failed");

        assert!(reply.is_success());
        assert!(request.contains("multipart/form-data; boundary="));
        assert!(request.contains(r#"name="image"; filename="image.png""#));
        assert!(request.contains("PNGDATA"));
        assert!(request.contains(r#"name="model""#));
        assert!(!request.to_ascii_lowercase().contains("authorization:"));
        Ok(())
    }

    #[test]
    fn get_returns_raw_bytes() -> anyhow::Result<()> {
        let (base, server) = one_shot_server("200 OK", "image/png", b"\x89PNG")?;
        let transport = ReqwestTransport::new(Duration::from_secs(10))?;
        let reply = transport.get(&format!("{base}/img.png"))?;
        server.join().expect("server thread failed");
        assert_eq!(reply.body, b"\x89PNG");
        assert_eq!(reply.content_type.as_deref(), Some("image/png"));
        Ok(())
    }

    #[test]
    fn unreachable_endpoint_is_a_transport_error() -> anyhow::Result<()> {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0")?;
            listener.local_addr()?.port()
        };
        let transport = ReqwestTransport::new(Duration::from_secs(5))?;
        let err = transport.get(&format!("http://127.0.0.1:{port}/gone")).err();
        assert!(matches!(err, Some(PipelineError::TransportError(_))));
        Ok(())
    }
}
