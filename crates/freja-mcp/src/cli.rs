// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! MCP source backed by an external agent CLI (`<tool> mcp list/add/remove`).
//!
//! The CLIs print line-oriented, colored output meant for humans; this
//! module strips ANSI, parses the `name: endpoint - status` lines, and
//! probes connected servers for their tool lists. Spinner-corrupted
//! (truncated) output is retried with backoff before giving up.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::ansi::strip_ansi;
use crate::probe::Prober;
use crate::source::McpSource;
use crate::types::{InstallReport, McpServer, McpTransport, ServerStatus, TransportKind};

const DETECT_ATTEMPTS: u32 = 3;
const DETECT_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Output of one CLI invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(&self) -> bool {
        self.status == 0
    }
}

/// Runs the external tool. Tests substitute a scripted runner.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &Path, args: &[String]) -> anyhow::Result<CommandOutput>;
}

/// Real subprocess execution with a hard deadline.
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &Path, args: &[String]) -> anyhow::Result<CommandOutput> {
        let output = tokio::time::timeout(
            DETECT_TIMEOUT,
            Command::new(program)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("{} timed out", program.display()))??;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Scope fallback order for `mcp remove`.
const REMOVE_SCOPES: &[&str] = &["local", "user", "project"];

pub struct CliSource {
    name: String,
    program: PathBuf,
    supported: Vec<TransportKind>,
    runner: Arc<dyn CommandRunner>,
    prober: Arc<dyn Prober>,
}

impl CliSource {
    pub fn new(
        name: impl Into<String>,
        program: impl Into<PathBuf>,
        supported: Vec<TransportKind>,
        runner: Arc<dyn CommandRunner>,
        prober: Arc<dyn Prober>,
    ) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            supported,
            runner,
            prober,
        }
    }

    /// The claude CLI: all four transports (its `http` flag speaks
    /// streamable HTTP).
    pub fn claude(runner: Arc<dyn CommandRunner>, prober: Arc<dyn Prober>) -> Self {
        Self::new(
            "claude",
            "claude",
            vec![
                TransportKind::Stdio,
                TransportKind::Sse,
                TransportKind::Http,
                TransportKind::StreamableHttp,
            ],
            runner,
            prober,
        )
    }

    /// The gemini CLI: stdio and SSE only.
    pub fn gemini(runner: Arc<dyn CommandRunner>, prober: Arc<dyn Prober>) -> Self {
        Self::new(
            "gemini",
            "gemini",
            vec![TransportKind::Stdio, TransportKind::Sse],
            runner,
            prober,
        )
    }

    fn program_for(&self, cli_path: Option<&Path>) -> PathBuf {
        cli_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.program.clone())
    }

    fn add_args(&self, server: &McpServer) -> Option<Vec<String>> {
        let mut args = vec!["mcp".to_string(), "add".to_string()];
        match &server.transport {
            McpTransport::Stdio { command, args: cmd_args, env } => {
                for (k, v) in env {
                    args.push("--env".into());
                    args.push(format!("{k}={v}"));
                }
                args.push(server.name.clone());
                args.push("--".into());
                args.push(command.clone());
                args.extend(cmd_args.iter().cloned());
            }
            McpTransport::Sse { url, headers } => {
                args.push("--transport".into());
                args.push("sse".into());
                args.push(server.name.clone());
                args.push(url.clone());
                for (k, v) in headers {
                    args.push("--header".into());
                    args.push(format!("{k}: {v}"));
                }
            }
            McpTransport::Http { url, headers } | McpTransport::StreamableHttp { url, headers } => {
                args.push("--transport".into());
                args.push("http".into());
                args.push(server.name.clone());
                args.push(url.clone());
                for (k, v) in headers {
                    args.push("--header".into());
                    args.push(format!("{k}: {v}"));
                }
            }
        }
        Some(args)
    }
}

/// One parsed `mcp list` line.
#[derive(Debug, PartialEq)]
struct ListedServer {
    name: String,
    transport: McpTransport,
    healthy: bool,
}

/// Parse the ANSI-stripped output of `<tool> mcp list`.
///
/// Returns the parsed servers plus whether a list header was seen; the
/// header with zero entries is the truncation signature that triggers a
/// retry.
fn parse_list_output(raw: &str) -> (Vec<ListedServer>, bool) {
    let clean = strip_ansi(raw);
    let mut servers = Vec::new();
    let mut saw_header = false;

    for line in clean.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.contains("MCP server") || line.ends_with("…") || line.ends_with("...") {
            saw_header = true;
            continue;
        }
        let Some((name, rest)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() || name.contains(' ') {
            continue;
        }
        let rest = rest.trim();
        let (endpoint, status) = match rest.rsplit_once(" - ") {
            Some((e, s)) => (e.trim(), s.trim()),
            None => (rest, ""),
        };
        if endpoint.is_empty() {
            continue;
        }

        let healthy = status.contains('✓')
            || (status.contains("Connected") && !status.contains("Failed"));

        let transport = if let Some(url) = endpoint.strip_suffix("(SSE)") {
            McpTransport::Sse {
                url: url.trim().to_string(),
                headers: Default::default(),
            }
        } else if let Some(url) = endpoint.strip_suffix("(HTTP)") {
            McpTransport::StreamableHttp {
                url: url.trim().to_string(),
                headers: Default::default(),
            }
        } else if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            McpTransport::Http {
                url: endpoint.to_string(),
                headers: Default::default(),
            }
        } else {
            let mut parts = endpoint.split_whitespace().map(str::to_string);
            let Some(command) = parts.next() else {
                continue;
            };
            McpTransport::Stdio {
                command,
                args: parts.collect(),
                env: Default::default(),
            }
        };

        servers.push(ListedServer {
            name: name.to_string(),
            transport,
            healthy,
        });
    }
    (servers, saw_header)
}

#[async_trait]
impl McpSource for CliSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_transports(&self) -> &[TransportKind] {
        &self.supported
    }

    async fn detect(&self, cli_path: Option<&Path>) -> anyhow::Result<Vec<McpServer>> {
        let program = self.program_for(cli_path);
        let args = vec!["mcp".to_string(), "list".to_string()];

        let mut listed = Vec::new();
        for attempt in 1..=DETECT_ATTEMPTS {
            let output = self.runner.run(&program, &args).await?;
            if !output.ok() && output.stdout.trim().is_empty() {
                anyhow::bail!(
                    "{} mcp list failed: {}",
                    self.name,
                    output.stderr.trim()
                );
            }
            let (parsed, saw_header) = parse_list_output(&output.stdout);
            if !parsed.is_empty() || !saw_header {
                listed = parsed;
                break;
            }
            // Header but no entries: the spinner ate the list. Back off
            // and ask again.
            warn!(source = %self.name, attempt, "truncated mcp list output, retrying");
            if attempt < DETECT_ATTEMPTS {
                tokio::time::sleep(Duration::from_millis(150 * attempt as u64)).await;
            }
        }

        let mut servers = Vec::with_capacity(listed.len());
        for entry in listed {
            let mut server = McpServer::new(&entry.name, entry.transport);
            server.original_json = Some(json!({
                "source": self.name,
                "healthy": entry.healthy,
            }));
            if entry.healthy {
                let probe = self.prober.probe(&server, PROBE_TIMEOUT).await;
                if probe.success {
                    server.status = ServerStatus::Connected;
                    server.tools = probe.tools.unwrap_or_default();
                } else {
                    debug!(server = %server.name, error = ?probe.error, "probe failed");
                    server.status = ServerStatus::Disconnected;
                }
            } else {
                server.status = ServerStatus::Disconnected;
            }
            server.updated_at = Utc::now();
            servers.push(server);
        }
        Ok(servers)
    }

    async fn install(&self, servers: &[McpServer]) -> Vec<InstallReport> {
        let program = self.program_for(None);
        let mut reports = Vec::with_capacity(servers.len());

        for server in servers {
            if !self.supported.contains(&server.transport.kind()) {
                warn!(
                    source = %self.name,
                    server = %server.name,
                    transport = ?server.transport.kind(),
                    "transport unsupported by this tool, skipping"
                );
                reports.push(InstallReport {
                    name: server.name.clone(),
                    success: false,
                    error: Some(format!(
                        "transport {:?} not supported by {}",
                        server.transport.kind(),
                        self.name
                    )),
                    skipped: true,
                });
                continue;
            }
            let Some(args) = self.add_args(server) else {
                continue;
            };
            match self.runner.run(&program, &args).await {
                Ok(output) if output.ok() => {
                    reports.push(InstallReport {
                        name: server.name.clone(),
                        success: true,
                        error: None,
                        skipped: false,
                    });
                }
                Ok(output) => {
                    reports.push(InstallReport {
                        name: server.name.clone(),
                        success: false,
                        error: Some(output.stderr.trim().to_string()),
                        skipped: false,
                    });
                }
                Err(e) => {
                    reports.push(InstallReport {
                        name: server.name.clone(),
                        success: false,
                        error: Some(e.to_string()),
                        skipped: false,
                    });
                }
            }
        }
        reports
    }

    async fn remove(&self, name: &str) -> anyhow::Result<()> {
        let program = self.program_for(None);
        let mut last_error = None;

        for scope in REMOVE_SCOPES {
            let args = vec![
                "mcp".to_string(),
                "remove".to_string(),
                name.to_string(),
                "-s".to_string(),
                scope.to_string(),
            ];
            match self.runner.run(&program, &args).await {
                Ok(output) if output.ok() => {
                    debug!(source = %self.name, server = name, scope, "removed");
                    return Ok(());
                }
                Ok(output) => {
                    let stderr = output.stderr.to_lowercase();
                    if stderr.contains("not found") || stderr.contains("no mcp server") {
                        // Absent in this scope; that is what we wanted.
                        return Ok(());
                    }
                    last_error = Some(anyhow::anyhow!(
                        "{} mcp remove -s {scope}: {}",
                        self.name,
                        output.stderr.trim()
                    ));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("remove failed in every scope")))
    }
}

/// Locate an executable on PATH. Used by the multiplexer's
/// integrated-agent special case.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::StubProber;
    use crate::types::ConnectionTest;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Plays back scripted outputs and records invocations.
    struct ScriptedRunner {
        outputs: Mutex<Vec<CommandOutput>>,
        calls: Mutex<Vec<Vec<String>>>,
        invocations: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(outputs: Vec<CommandOutput>) -> Arc<Self> {
            Arc::new(Self {
                outputs: Mutex::new(outputs),
                calls: Mutex::new(Vec::new()),
                invocations: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, _program: &Path, args: &[String]) -> anyhow::Result<CommandOutput> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().unwrap().push(args.to_vec());
            let mut outputs = self.outputs.lock().unwrap();
            if outputs.is_empty() {
                anyhow::bail!("no scripted output left");
            }
            Ok(outputs.remove(0))
        }
    }

    fn out(stdout: &str) -> CommandOutput {
        CommandOutput {
            status: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            status: 1,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    const LIST: &str = "\
Checking MCP server health...

filesystem: npx -y @modelcontextprotocol/server-filesystem /tmp - ✓ Connected
linear: https://mcp.linear.app/sse (SSE) - ✗ Failed to connect
";

    #[test]
    fn parses_stdio_and_sse_lines() {
        let (servers, header) = parse_list_output(LIST);
        assert!(header);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name, "filesystem");
        assert!(servers[0].healthy);
        assert!(matches!(
            &servers[0].transport,
            McpTransport::Stdio { command, args, .. }
                if command == "npx" && args.len() == 3
        ));
        assert!(!servers[1].healthy);
        assert!(matches!(
            &servers[1].transport,
            McpTransport::Sse { url, .. } if url == "https://mcp.linear.app/sse"
        ));
    }

    #[test]
    fn parses_colored_output() {
        let colored = "Checking MCP server health...\n\nfs: npx server - \x1b[32m✓ Connected\x1b[0m\n";
        let (servers, _) = parse_list_output(colored);
        assert_eq!(servers.len(), 1);
        assert!(servers[0].healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn detect_probes_healthy_servers_only() {
        let runner = ScriptedRunner::new(vec![out(LIST)]);
        let prober = StubProber::returning(ConnectionTest::ok(vec![
            "read_file".into(),
            "write_file".into(),
        ]));
        let source = CliSource::claude(runner, prober.clone());

        let servers = source.detect(None).await.unwrap();
        assert_eq!(servers.len(), 2);

        let fs = &servers[0];
        assert_eq!(fs.status, ServerStatus::Connected);
        assert_eq!(fs.tools, vec!["read_file", "write_file"]);

        let linear = &servers[1];
        assert_eq!(linear.status, ServerStatus::Disconnected);
        assert!(linear.tools.is_empty());

        // Only the healthy server was probed.
        assert_eq!(prober.probes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_output_retries_up_to_three_times() {
        let truncated = "Checking MCP server health...\n";
        let runner = ScriptedRunner::new(vec![out(truncated), out(truncated), out(LIST)]);
        let prober = StubProber::returning(ConnectionTest::ok(vec!["t".into()]));
        let source = CliSource::claude(runner.clone(), prober);

        let servers = source.detect(None).await.unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(runner.invocations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn truncated_output_gives_up_empty_after_three() {
        let truncated = "Checking MCP server health...\n";
        let runner =
            ScriptedRunner::new(vec![out(truncated), out(truncated), out(truncated)]);
        let prober = StubProber::returning(ConnectionTest::ok(vec![]));
        let source = CliSource::claude(runner.clone(), prober);

        let servers = source.detect(None).await.unwrap();
        assert!(servers.is_empty());
        assert_eq!(runner.invocations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn install_skips_unsupported_transport_and_continues() {
        let runner = ScriptedRunner::new(vec![out("added")]);
        let prober = StubProber::returning(ConnectionTest::ok(vec![]));
        // gemini speaks stdio + sse only.
        let source = CliSource::gemini(runner.clone(), prober);

        let http_server = McpServer::new(
            "remote",
            McpTransport::StreamableHttp {
                url: "https://example.com/mcp".into(),
                headers: HashMap::new(),
            },
        );
        let stdio_server = McpServer::new(
            "fs",
            McpTransport::Stdio {
                command: "npx".into(),
                args: vec!["server-fs".into()],
                env: HashMap::new(),
            },
        );

        let reports = source.install(&[http_server, stdio_server]).await;
        assert_eq!(reports.len(), 2);
        assert!(reports[0].skipped);
        assert!(!reports[0].success);
        assert!(reports[1].success);

        // Exactly one CLI invocation: the skipped server never ran.
        assert_eq!(runner.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn install_failure_does_not_abort_batch() {
        let runner = ScriptedRunner::new(vec![failed("config locked"), out("added")]);
        let prober = StubProber::returning(ConnectionTest::ok(vec![]));
        let source = CliSource::claude(runner, prober);

        let a = McpServer::new(
            "a",
            McpTransport::Stdio {
                command: "npx".into(),
                args: vec![],
                env: HashMap::new(),
            },
        );
        let b = McpServer::new(
            "b",
            McpTransport::Stdio {
                command: "npx".into(),
                args: vec![],
                env: HashMap::new(),
            },
        );

        let reports = source.install(&[a, b]).await;
        assert!(!reports[0].success);
        assert_eq!(reports[0].error.as_deref(), Some("config locked"));
        assert!(reports[1].success);
    }

    #[tokio::test]
    async fn remove_falls_back_through_scopes() {
        let runner = ScriptedRunner::new(vec![
            failed("No MCP server found with name fs in local config"),
            out("removed"),
        ]);
        let prober = StubProber::returning(ConnectionTest::ok(vec![]));
        let source = CliSource::claude(runner.clone(), prober);

        // "not found" in the first scope already counts as success.
        source.remove("fs").await.unwrap();
        assert_eq!(runner.invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remove_tries_next_scope_on_real_error() {
        let runner = ScriptedRunner::new(vec![failed("permission denied"), out("removed")]);
        let prober = StubProber::returning(ConnectionTest::ok(vec![]));
        let source = CliSource::claude(runner.clone(), prober);

        source.remove("fs").await.unwrap();
        let calls = runner.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0][4], "local");
        assert_eq!(calls[1][4], "user");
    }

    #[tokio::test]
    async fn stdio_add_args_use_double_dash() {
        let runner = ScriptedRunner::new(vec![out("added")]);
        let prober = StubProber::returning(ConnectionTest::ok(vec![]));
        let source = CliSource::claude(runner.clone(), prober);

        let server = McpServer::new(
            "fs",
            McpTransport::Stdio {
                command: "npx".into(),
                args: vec!["-y".into(), "server-fs".into()],
                env: HashMap::new(),
            },
        );
        source.install(&[server]).await;

        let calls = runner.calls();
        assert_eq!(
            calls[0],
            vec!["mcp", "add", "fs", "--", "npx", "-y", "server-fs"]
                .into_iter()
                .map(String::from)
                .collect::<Vec<_>>()
        );
    }
}
