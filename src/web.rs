//! Thin HTTP surface over a [`TaskClient`].
//!
//! Routes:
//!
//! | Method | Path                       | Body / result                                |
//! |--------|----------------------------|----------------------------------------------|
//! | GET    | `/version`                 | `{"version": KERNEL_VERSION}`                |
//! | POST   | `/chat`                    | `{"prompt": "/implement X"}` → `{"taskID"}`  |
//! | GET    | `/task/{id}`               | task status / result / error                 |
//! | GET    | `/proposals`               | every recorded decision card                 |
//! | GET    | `/memory`                  | avoidance rules                              |
//! | GET    | `/reviews`                 | proposals awaiting a human decision          |
//! | POST   | `/proposals/{id}/approve`  |                                              |
//! | POST   | `/proposals/{id}/decline`  | optional `{"reason": "..."}`                 |
//! | GET    | `/metrics`                 | axioms, metabolism, task counts              |

use std::net::SocketAddr;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{KernelError, Result};
use crate::self_modify::orchestrator::TaskClient;

pub const KERNEL_VERSION: &str = "4.0.0-genesis";

pub const HELP_TEXT: &str = "Commands: /help, /implement [description], /proposals, /memory";

const MAX_REQUEST_BYTES: usize = 1 << 20;

// ---------------------------------------------------------------------------
// Chat commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatCommand {
    Help,
    Implement(String),
    Proposals,
    Memory,
    Unknown(String),
    /// Anything that is not a slash command.
    Text,
}

pub fn parse_command(prompt: &str) -> ChatCommand {
    let prompt = prompt.trim();
    if !prompt.starts_with('/') {
        return ChatCommand::Text;
    }
    let (cmd, rest) = prompt.split_once(char::is_whitespace).unwrap_or((prompt, ""));
    match cmd {
        "/help" => ChatCommand::Help,
        "/implement" => ChatCommand::Implement(rest.trim().to_string()),
        "/proposals" => ChatCommand::Proposals,
        "/memory" => ChatCommand::Memory,
        other => ChatCommand::Unknown(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    fn error(status: u16, message: impl Into<String>) -> Self {
        Self { status, body: json!({ "error": message.into() }) }
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        _ => "Internal Server Error",
    }
}

/// Serialize a response to raw HTTP/1.1.
pub fn format_response(resp: &Response) -> String {
    let body = resp.body.to_string();
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nAccess-Control-Allow-Origin: *\r\nConnection: close\r\n\r\n{}",
        resp.status,
        reason_phrase(resp.status),
        body.len(),
        body,
    )
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ChatBody {
    prompt: String,
}

#[derive(Deserialize, Default)]
struct DeclineBody {
    #[serde(default)]
    reason: String,
}

fn to_json<T: serde::Serialize>(v: &T) -> Response {
    match serde_json::to_value(v) {
        Ok(body) => Response::ok(body),
        Err(e) => Response::error(500, e.to_string()),
    }
}

fn proposals_handler(client: &dyn TaskClient) -> Response {
    to_json(&client.proposals())
}

fn chat_handler(client: &dyn TaskClient, body: &[u8]) -> Response {
    let chat: ChatBody = match serde_json::from_slice(body) {
        Ok(c) => c,
        Err(e) => return Response::error(400, format!("invalid chat body: {e}")),
    };
    match parse_command(&chat.prompt) {
        ChatCommand::Help => Response::ok(json!({ "response": HELP_TEXT })),
        ChatCommand::Implement(desc) if desc.is_empty() => {
            Response::error(400, "usage: /implement [description]")
        }
        ChatCommand::Implement(desc) => Response::ok(json!({ "taskID": client.create_task(&desc) })),
        ChatCommand::Proposals => proposals_handler(client),
        ChatCommand::Memory => to_json(&client.avoidance_rules()),
        ChatCommand::Unknown(cmd) => Response::ok(json!({ "response": format!("Unknown command: {cmd}") })),
        ChatCommand::Text => Response::ok(json!({ "response": "Awaiting command." })),
    }
}

fn review_handler(client: &dyn TaskClient, id: &str, action: &str, body: &[u8]) -> Response {
    let decided = match action {
        "approve" => client.approve(id),
        "decline" => {
            let reason = if body.is_empty() {
                DeclineBody::default().reason
            } else {
                match serde_json::from_slice::<DeclineBody>(body) {
                    Ok(b) => b.reason,
                    Err(e) => return Response::error(400, format!("invalid decline body: {e}")),
                }
            };
            let reason = if reason.trim().is_empty() { "declined by reviewer".to_string() } else { reason };
            client.decline(id, &reason)
        }
        _ => return Response::error(404, "not found"),
    };
    if decided {
        Response::ok(json!({ "proposal_id": id, "decision": action }))
    } else {
        Response::error(404, format!("no proposal {id} awaiting review"))
    }
}

/// Dispatch one parsed request.
pub fn route(client: &dyn TaskClient, method: &str, path: &str, body: &[u8]) -> Response {
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method, segments.as_slice()) {
        ("GET", ["version"]) => Response::ok(json!({ "version": KERNEL_VERSION })),
        ("POST", ["chat"]) => chat_handler(client, body),
        ("GET", ["task", id]) => match client.task(id) {
            Some(task) => to_json(&task),
            None => Response::error(404, format!("task {id} not found")),
        },
        ("GET", ["proposals"]) => proposals_handler(client),
        ("POST", ["proposals", id, action]) => review_handler(client, id, action, body),
        ("GET", ["memory"]) => to_json(&client.avoidance_rules()),
        ("GET", ["reviews"]) => to_json(&client.pending_reviews()),
        ("GET", ["metrics"]) => to_json(&client.vitals()),
        (_, ["version"] | ["chat"] | ["task", _] | ["proposals"] | ["memory"] | ["reviews"] | ["metrics"]) => {
            Response::error(405, format!("{method} not allowed on {path}"))
        }
        _ => Response::error(404, "not found"),
    }
}

// ---------------------------------------------------------------------------
// Server loop
// ---------------------------------------------------------------------------

/// Bind `addr` and serve until the listener fails.
pub async fn serve(addr: &str, client: Arc<dyn TaskClient>) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| KernelError::Http(format!("cannot bind {addr}: {e}")))?;
    serve_on(listener, client).await
}

pub async fn serve_on(listener: TcpListener, client: Arc<dyn TaskClient>) -> Result<()> {
    let local: Option<SocketAddr> = listener.local_addr().ok();
    tracing::info!(target: "kernel::web", addr = ?local, "listening");
    loop {
        let (stream, peer) = listener.accept().await?;
        let client = Arc::clone(&client);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, client).await {
                tracing::debug!(target: "kernel::web", %peer, error = %e, "connection error");
            }
        });
    }
}

/// Parsed request head plus body.
struct RawRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

enum ReadOutcome {
    Request(RawRequest),
    TooLarge,
    Malformed,
    Closed,
}

async fn read_request(stream: &mut TcpStream) -> Result<ReadOutcome> {
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(ReadOutcome::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_REQUEST_BYTES {
            return Ok(ReadOutcome::TooLarge);
        }

        let mut headers = [httparse::EMPTY_HEADER; 32];
        let mut req = httparse::Request::new(&mut headers);
        let head_len = match req.parse(&buf) {
            Ok(httparse::Status::Complete(len)) => len,
            Ok(httparse::Status::Partial) => continue,
            Err(_) => return Ok(ReadOutcome::Malformed),
        };
        let content_length = req
            .headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case("content-length"))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);
        let end = match head_len.checked_add(content_length) {
            Some(end) if end <= MAX_REQUEST_BYTES => end,
            _ => return Ok(ReadOutcome::TooLarge),
        };
        let method = req.method.unwrap_or("GET").to_string();
        let path = req.path.unwrap_or("/").to_string();

        while buf.len() < end {
            let n = stream.read(&mut chunk).await?;
            if n == 0 {
                return Ok(ReadOutcome::Malformed);
            }
            buf.extend_from_slice(&chunk[..n]);
        }
        let body = buf[head_len..end].to_vec();
        return Ok(ReadOutcome::Request(RawRequest { method, path, body }));
    }
}

async fn handle_connection(mut stream: TcpStream, client: Arc<dyn TaskClient>) -> Result<()> {
    let resp = match read_request(&mut stream).await? {
        ReadOutcome::Request(req) => {
            let resp = route(client.as_ref(), &req.method, &req.path, &req.body);
            tracing::debug!(target: "kernel::web", method = %req.method, path = %req.path, status = resp.status, "request");
            resp
        }
        ReadOutcome::TooLarge => Response::error(413, "request too large"),
        ReadOutcome::Malformed => Response::error(400, "malformed request"),
        ReadOutcome::Closed => return Ok(()),
    };
    stream.write_all(format_response(&resp).as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GoalEngineConfig, MemoryConfig, ReviewPolicy, VerifierConfig};
    use crate::self_modify::invariants::InvariantChecker;
    use crate::self_modify::memory::MemoryConsolidator;
    use crate::self_modify::merge::{InMemoryArtifactStore, InMemoryEntryPoints, Integrator};
    use crate::self_modify::orchestrator::{Orchestrator, OrchestratorConfig, PipelineParts};
    use crate::self_modify::planner::{make_card, Planner, StaticGenerator};
    use crate::self_modify::verify::{AssumePassHarness, Verifier};
    use crate::self_tune::goal_engine::GoalEngine;
    use std::time::Duration;

    fn orchestrator(review: ReviewPolicy) -> Orchestrator {
        let goal_engine = Arc::new(GoalEngine::new(&GoalEngineConfig::default()));
        let memory = MemoryConsolidator::spawn(&MemoryConfig { dream_delay_ms: 0 });
        let gen = Arc::new(StaticGenerator::new(make_card("Cache", "fn f() {}")));
        Orchestrator::new(
            OrchestratorConfig { review, ..OrchestratorConfig::default() },
            PipelineParts {
                planner: Planner::new(gen, Arc::clone(&goal_engine), memory.clone()),
                checker: InvariantChecker::default(),
                verifier: Verifier::new(&VerifierConfig::default(), Box::new(AssumePassHarness)),
                integrator: Integrator::new(
                    Arc::new(InMemoryArtifactStore::new()),
                    Arc::new(InMemoryEntryPoints::new()),
                ),
                goal_engine,
                memory,
                homeostasis: None,
            },
        )
    }

    fn chat(orc: &Orchestrator, prompt: &str) -> Response {
        let body = json!({ "prompt": prompt }).to_string();
        route(orc, "POST", "/chat", body.as_bytes())
    }

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("/help"), ChatCommand::Help);
        assert_eq!(parse_command("  /implement add a cache  "), ChatCommand::Implement("add a cache".into()));
        assert_eq!(parse_command("/implement"), ChatCommand::Implement(String::new()));
        assert_eq!(parse_command("/proposals"), ChatCommand::Proposals);
        assert_eq!(parse_command("/memory"), ChatCommand::Memory);
        assert_eq!(parse_command("/dance now"), ChatCommand::Unknown("/dance".into()));
        assert_eq!(parse_command("hello"), ChatCommand::Text);
    }

    #[test]
    fn test_format_response_sets_length() {
        let raw = format_response(&Response::ok(json!({ "a": 1 })));
        assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(raw.contains("Content-Length: 7\r\n"));
        assert!(raw.ends_with("{\"a\":1}"));
    }

    #[tokio::test]
    async fn test_version_route() {
        let orc = orchestrator(ReviewPolicy::AutoMerge);
        let r = route(&orc, "GET", "/version", b"");
        assert_eq!(r.body["version"], KERNEL_VERSION);
    }

    #[tokio::test]
    async fn test_chat_commands() {
        let orc = orchestrator(ReviewPolicy::AutoMerge);
        assert_eq!(chat(&orc, "/help").body["response"], HELP_TEXT);
        assert_eq!(chat(&orc, "what now?").body["response"], "Awaiting command.");
        assert_eq!(chat(&orc, "/dance").body["response"], "Unknown command: /dance");
        assert_eq!(chat(&orc, "/implement").status, 400);
        assert_eq!(route(&orc, "POST", "/chat", b"not json").status, 400);
    }

    #[tokio::test]
    async fn test_implement_then_poll_task() {
        let orc = orchestrator(ReviewPolicy::AutoMerge);
        let r = chat(&orc, "/implement faster cache");
        let id = r.body["taskID"].as_str().unwrap().to_string();
        orc.wait_terminal(&id, Duration::from_millis(5)).await.unwrap();
        let t = route(&orc, "GET", &format!("/task/{id}"), b"");
        assert_eq!(t.status, 200);
        assert_eq!(t.body["status"], "completed");
        assert_eq!(t.body["result"]["original_request"], "faster cache");
        assert_eq!(route(&orc, "GET", "/proposals", b"").body.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_task_and_route() {
        let orc = orchestrator(ReviewPolicy::AutoMerge);
        assert_eq!(route(&orc, "GET", "/task/nope", b"").status, 404);
        assert_eq!(route(&orc, "GET", "/nowhere", b"").status, 404);
        assert_eq!(route(&orc, "DELETE", "/proposals", b"").status, 405);
    }

    #[tokio::test]
    async fn test_review_routes() {
        let orc = orchestrator(ReviewPolicy::Required);
        let id = orc.implement("x");
        let pid = loop {
            if let Some(r) = orc.pending_reviews().first() {
                break r.proposal_id.clone();
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(route(&orc, "GET", "/reviews", b"").body.as_array().unwrap().len(), 1);
        let body = json!({ "reason": "too risky" }).to_string();
        let r = route(&orc, "POST", &format!("/proposals/{pid}/decline"), body.as_bytes());
        assert_eq!(r.status, 200);
        let t = orc.wait_terminal(&id, Duration::from_millis(5)).await.unwrap();
        assert!(t.error.unwrap().contains("too risky"));
        assert_eq!(route(&orc, "POST", &format!("/proposals/{pid}/approve"), b"").status, 404);
    }

    #[tokio::test]
    async fn test_metrics_route() {
        let orc = orchestrator(ReviewPolicy::AutoMerge);
        let r = route(&orc, "GET", "/metrics", b"");
        assert_eq!(r.status, 200);
        assert!(r.body["axioms"]["compression_efficiency"].is_number());
        assert_eq!(r.body["tasks_pending"], 0);
    }

    #[tokio::test]
    async fn test_server_round_trip_over_tcp() {
        let orc = orchestrator(ReviewPolicy::AutoMerge);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_on(listener, Arc::new(orc)));

        let mut sock = TcpStream::connect(addr).await.unwrap();
        let body = "{\"prompt\":\"/help\"}";
        let req = format!(
            "POST /chat HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        sock.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        sock.read_to_string(&mut out).await.unwrap();
        assert!(out.starts_with("HTTP/1.1 200 OK"));
        assert!(out.contains("/implement [description]"));
    }

    #[tokio::test]
    async fn test_huge_content_length_is_rejected() {
        let orc = orchestrator(ReviewPolicy::AutoMerge);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_on(listener, Arc::new(orc)));

        for length in [usize::MAX.to_string(), (MAX_REQUEST_BYTES + 1).to_string()] {
            let mut sock = TcpStream::connect(addr).await.unwrap();
            let req = format!("POST /chat HTTP/1.1\r\nHost: localhost\r\nContent-Length: {length}\r\n\r\n");
            sock.write_all(req.as_bytes()).await.unwrap();
            let mut out = String::new();
            sock.read_to_string(&mut out).await.unwrap();
            assert!(out.starts_with("HTTP/1.1 413 Payload Too Large"), "{length}: {out}");
        }
    }
}
