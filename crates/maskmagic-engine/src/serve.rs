//! HTTP front for [`Relay`], serving the backend endpoint the client posts to.

use std::io::Read;
use std::net::SocketAddr;

use anyhow::{anyhow, Context};
use serde_json::json;
use tiny_http::{Header, Request, Response, Server};

use crate::relay::{Relay, RelayReply};

pub const RELAY_ROUTE: &str = "/generateImage";

/// Two 4 MiB rasters base64-encoded, plus room for the prompt.
const MAX_BODY_BYTES: usize = 12 * 1024 * 1024;

pub struct RelayServer {
    server: Server,
    relay: Relay,
}

impl RelayServer {
    pub fn bind(addr: &str, relay: Relay) -> anyhow::Result<Self> {
        let server =
            Server::http(addr).map_err(|err| anyhow!("failed to listen on {addr}: {err}"))?;
        Ok(Self { server, relay })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.server_addr().to_ip()
    }

    /// Serves requests until the listener shuts down.
    pub fn run(&self) -> anyhow::Result<()> {
        tracing::info!(addr = ?self.local_addr(), route = RELAY_ROUTE, "relay listening");
        for request in self.server.incoming_requests() {
            self.respond(request);
        }
        Ok(())
    }

    /// Blocks for the next request and answers it.
    pub fn handle_next(&self) -> anyhow::Result<()> {
        let request = self.server.recv().context("relay listener failed")?;
        self.respond(request);
        Ok(())
    }

    fn respond(&self, mut request: Request) {
        let method = request.method().clone();
        let path = request.url().split('?').next().unwrap_or_default().to_string();
        tracing::debug!(%method, %path, "relay request");

        let reply = if path != RELAY_ROUTE {
            RelayReply {
                status: 404,
                body: Some(json!({ "error": "Not found" })),
            }
        } else if request.body_length().is_some_and(|len| len > MAX_BODY_BYTES) {
            RelayReply {
                status: 413,
                body: Some(json!({ "error": "Request body too large" })),
            }
        } else {
            match read_body(&mut request) {
                Ok(body) => self.relay.handle(method.as_str(), &body),
                Err(err) => {
                    tracing::warn!("failed reading relay request body: {err:#}");
                    RelayReply {
                        status: 400,
                        body: Some(json!({ "error": "Invalid JSON body" })),
                    }
                }
            }
        };

        let status = reply.status;
        if let Err(err) = request.respond(into_response(reply)) {
            tracing::warn!(status, "failed writing relay response: {err}");
        }
    }
}

fn read_body(request: &mut Request) -> anyhow::Result<Vec<u8>> {
    let mut body = Vec::new();
    request
        .as_reader()
        .take(MAX_BODY_BYTES as u64 + 1)
        .read_to_end(&mut body)?;
    anyhow::ensure!(body.len() <= MAX_BODY_BYTES, "body exceeds {MAX_BODY_BYTES} bytes");
    Ok(body)
}

fn into_response(reply: RelayReply) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut headers: Vec<(&str, &str)> = reply.headers().to_vec();
    let data = match &reply.body {
        Some(body) => {
            headers.push(("Content-Type", "application/json"));
            body.to_string().into_bytes()
        }
        None => Vec::new(),
    };
    let mut response = Response::from_data(data).with_status_code(reply.status);
    for (name, value) in headers {
        if let Ok(header) = Header::from_bytes(name.as_bytes(), value.as_bytes()) {
            response.add_header(header);
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use maskmagic_contracts::config::RelayConfig;
    use maskmagic_contracts::wire::encode_data_uri;
    use reqwest::blocking::Client;
    use serde_json::Value;

    use super::*;
    use crate::transport::testing::{json_reply, Call, ScriptedTransport};
    use crate::relay::RELAY_CORS_HEADERS;
    use crate::transport::HttpReply;

    fn server_with(
        replies: Vec<crate::error::Result<HttpReply>>,
    ) -> anyhow::Result<(RelayServer, Arc<ScriptedTransport>)> {
        let transport = Arc::new(ScriptedTransport::new(replies));
        let config = RelayConfig {
            api_base: "https://upstream.test/v1".to_string(),
            api_key: Some("sk-test".to_string()),
        };
        let server = RelayServer::bind("127.0.0.1:0", Relay::new(config, Arc::clone(&transport)))?;
        Ok((server, transport))
    }

    #[test]
    fn posts_are_relayed_with_cors_headers() -> anyhow::Result<()> {
        let upstream = json!({"created": 3, "data": [{"url": "https://x/out.png"}]});
        let (server, transport) = server_with(vec![json_reply(200, upstream.clone())])?;
        let addr = server.local_addr().context("server has no TCP address")?;

        let client = thread::spawn(move || -> anyhow::Result<(u16, Option<String>, Value)> {
            let body = json!({
                "image": encode_data_uri("image/png", b"IMAGE"),
                "mask": encode_data_uri("image/png", b"MASK"),
                "prompt": "add a hat",
            });
            let response = Client::new()
                .post(format!("http://{addr}{RELAY_ROUTE}"))
                .json(&body)
                .send()?;
            let status = response.status().as_u16();
            let origin = response
                .headers()
                .get("access-control-allow-origin")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            Ok((status, origin, response.json()?))
        });
        server.handle_next()?;
        let (status, origin, body) = client
            .join()
            .map_err(|_| anyhow!("client thread panicked"))??;

        assert_eq!(status, 200);
        assert_eq!(origin.as_deref(), Some("*"));
        assert_eq!(body, upstream);
        let calls = transport.calls();
        assert!(matches!(calls.as_slice(), [Call::PostMultipart { .. }]));
        Ok(())
    }

    #[test]
    fn preflight_and_unknown_routes_never_reach_upstream() -> anyhow::Result<()> {
        let (server, transport) = server_with(Vec::new())?;
        let addr = server.local_addr().context("server has no TCP address")?;

        let client = thread::spawn(move || -> anyhow::Result<(u16, Option<String>, u16)> {
            let client = Client::new();
            let preflight = client
                .request(reqwest::Method::OPTIONS, format!("http://{addr}{RELAY_ROUTE}"))
                .send()?;
            let methods = preflight
                .headers()
                .get("access-control-allow-methods")
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            let missing = client.post(format!("http://{addr}/elsewhere")).body("{}").send()?;
            Ok((preflight.status().as_u16(), methods, missing.status().as_u16()))
        });
        server.handle_next()?;
        server.handle_next()?;
        let (preflight, methods, missing) = client
            .join()
            .map_err(|_| anyhow!("client thread panicked"))??;

        assert_eq!(preflight, 204);
        assert_eq!(methods.as_deref(), Some("POST, OPTIONS"));
        assert_eq!(missing, 404);
        assert!(transport.calls().is_empty());
        assert!(RELAY_CORS_HEADERS.contains(&("Access-Control-Allow-Methods", "POST, OPTIONS")));
        Ok(())
    }
}
