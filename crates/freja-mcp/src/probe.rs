// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Transport probes: open a short-lived MCP client, list tools, close.
//!
//! - `stdio` spawns the server command (with one retry after an npm
//!   cache cleanup when the spawn trips over `ENOTEMPTY`, a known
//!   package-manager cache corruption signature);
//! - `sse` preflights a GET to catch `401 WWW-Authenticate` before
//!   opening the SSE client;
//! - `http` speaks one `initialize` + `tools/list` exchange over POST;
//! - `streamable_http` opens the streamable client.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rmcp::{
    model::{ClientCapabilities, ClientInfo, Implementation},
    transport::{ConfigureCommandExt, SseClientTransport, StreamableHttpClientTransport, TokioChildProcess},
    ClientHandler, ServiceExt,
};
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::types::{ConnectionTest, McpServer, McpTransport};

/// Probes one server. The multiplexer and the CLI sources both go
/// through this seam, so tests can stub the network away.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, server: &McpServer, timeout: Duration) -> ConnectionTest;
}

/// Scripted prober for tests.
pub struct StubProber {
    result: ConnectionTest,
    count: AtomicUsize,
}

impl StubProber {
    pub fn returning(result: ConnectionTest) -> Arc<Self> {
        Arc::new(Self {
            result,
            count: AtomicUsize::new(0),
        })
    }

    /// How many probes ran.
    pub fn probes(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for StubProber {
    async fn probe(&self, _server: &McpServer, _timeout: Duration) -> ConnectionTest {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.result.clone()
    }
}

/// MCP client identity presented by probes.
#[derive(Clone)]
struct ProbeClient {
    info: ClientInfo,
}

impl ProbeClient {
    fn new() -> Self {
        Self {
            info: ClientInfo {
                protocol_version: Default::default(),
                capabilities: ClientCapabilities::default(),
                client_info: Implementation {
                    name: "freja-probe".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    ..Implementation::default()
                },
                ..ClientInfo::default()
            },
        }
    }
}

impl ClientHandler for ProbeClient {
    fn get_info(&self) -> ClientInfo {
        self.info.clone()
    }
}

/// The production prober.
pub struct TransportProber;

#[async_trait]
impl Prober for TransportProber {
    async fn probe(&self, server: &McpServer, timeout: Duration) -> ConnectionTest {
        let attempt = tokio::time::timeout(timeout, probe_once(server));
        match attempt.await {
            Ok(result) => result,
            Err(_) => ConnectionTest::failed(format!("probe of {} timed out", server.name)),
        }
    }
}

async fn probe_once(server: &McpServer) -> ConnectionTest {
    match &server.transport {
        McpTransport::Stdio { command, args, env } => {
            match probe_stdio(command, args, env).await {
                Ok(tools) => ConnectionTest::ok(tools),
                Err(e) if e.to_string().contains("ENOTEMPTY") => {
                    // Known npm cache corruption; clean once and retry.
                    warn!(server = %server.name, "ENOTEMPTY from spawn, cleaning npm cache");
                    let _ = Command::new("npm")
                        .args(["cache", "clean", "--force"])
                        .output()
                        .await;
                    match probe_stdio(command, args, env).await {
                        Ok(tools) => ConnectionTest::ok(tools),
                        Err(e) => ConnectionTest::failed(e.to_string()),
                    }
                }
                Err(e) => ConnectionTest::failed(e.to_string()),
            }
        }
        McpTransport::Sse { url, headers } => probe_sse(url, headers).await,
        McpTransport::Http { url, headers } => probe_http(url, headers).await,
        McpTransport::StreamableHttp { url, .. } => probe_streamable(url).await,
    }
}

async fn probe_stdio(
    command: &str,
    args: &[String],
    env: &std::collections::HashMap<String, String>,
) -> anyhow::Result<Vec<String>> {
    let args = args.to_vec();
    let env = env.clone();
    let transport = TokioChildProcess::new(Command::new(command).configure(move |cmd| {
        cmd.args(&args)
            .envs(&env)
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true);
    }))?;

    let client = ProbeClient::new().serve(transport).await?;
    let tools = client.peer().list_tools(Default::default()).await?;
    let names = tools.tools.iter().map(|t| t.name.to_string()).collect();
    let _ = client.cancel().await;
    Ok(names)
}

async fn probe_sse(
    url: &str,
    headers: &std::collections::HashMap<String, String>,
) -> ConnectionTest {
    // Preflight: a bare GET tells us about auth without the SSE ceremony.
    let http = reqwest::Client::new();
    let mut preflight = http.get(url);
    for (k, v) in headers {
        preflight = preflight.header(k, v);
    }
    match preflight.send().await {
        Ok(response) if response.status() == reqwest::StatusCode::UNAUTHORIZED => {
            let challenge = response
                .headers()
                .get(reqwest::header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("Bearer")
                .to_string();
            return ConnectionTest::unauthorized(challenge);
        }
        Ok(_) => {}
        Err(e) => return ConnectionTest::failed(format!("sse preflight: {e}")),
    }

    match sse_list_tools(url).await {
        Ok(tools) => ConnectionTest::ok(tools),
        Err(e) => ConnectionTest::failed(e.to_string()),
    }
}

async fn sse_list_tools(url: &str) -> anyhow::Result<Vec<String>> {
    let transport = SseClientTransport::start(url.to_string()).await?;
    let client = ProbeClient::new().serve(transport).await?;
    let tools = client.peer().list_tools(Default::default()).await?;
    let names = tools.tools.iter().map(|t| t.name.to_string()).collect();
    let _ = client.cancel().await;
    Ok(names)
}

/// Plain JSON-RPC over POST: `initialize` then `tools/list`. Some hosts
/// expose this minimal dialect without the streamable session handshake.
async fn probe_http(
    url: &str,
    headers: &std::collections::HashMap<String, String>,
) -> ConnectionTest {
    let http = reqwest::Client::new();

    let post = |body: Value| {
        let mut request = http.post(url).json(&body);
        for (k, v) in headers {
            request = request.header(k, v);
        }
        request.header("Accept", "application/json, text/event-stream")
    };

    let init = post(json!({
        "jsonrpc": "2.0", "id": 1, "method": "initialize",
        "params": {
            "protocolVersion": "2025-03-26",
            "capabilities": {},
            "clientInfo": {"name": "freja-probe", "version": env!("CARGO_PKG_VERSION")}
        }
    }))
    .send()
    .await;

    let response = match init {
        Ok(r) => r,
        Err(e) => return ConnectionTest::failed(format!("http initialize: {e}")),
    };
    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
        let challenge = response
            .headers()
            .get(reqwest::header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("Bearer")
            .to_string();
        return ConnectionTest::unauthorized(challenge);
    }
    if !response.status().is_success() {
        return ConnectionTest::failed(format!("http initialize: status {}", response.status()));
    }

    let listed = post(json!({"jsonrpc": "2.0", "id": 2, "method": "tools/list", "params": {}}))
        .send()
        .await;
    let response = match listed {
        Ok(r) => r,
        Err(e) => return ConnectionTest::failed(format!("http tools/list: {e}")),
    };
    let body: Value = match response.json().await {
        Ok(v) => v,
        Err(e) => return ConnectionTest::failed(format!("http tools/list decode: {e}")),
    };
    let tools = extract_tool_names(&body);
    debug!(count = tools.len(), "http probe listed tools");
    ConnectionTest::ok(tools)
}

async fn probe_streamable(url: &str) -> ConnectionTest {
    let run = async {
        let transport = StreamableHttpClientTransport::from_uri(url.to_string());
        let client = ProbeClient::new().serve(transport).await?;
        let tools = client.peer().list_tools(Default::default()).await?;
        let names: Vec<String> = tools.tools.iter().map(|t| t.name.to_string()).collect();
        let _ = client.cancel().await;
        Ok::<_, anyhow::Error>(names)
    };
    match run.await {
        Ok(tools) => ConnectionTest::ok(tools),
        Err(e) => ConnectionTest::failed(e.to_string()),
    }
}

/// Pull tool names out of a `tools/list` JSON-RPC reply.
fn extract_tool_names(body: &Value) -> Vec<String> {
    body.pointer("/result/tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t.get("name").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
