//! `switchyard-echo`: reference worker speaking the wire protocol.
//!
//! Answers the `initialize` handshake, echoes `message` and `analyze`
//! params, answers `tools/call` for declared tools and exits on the
//! `shutdown` notification or end of input. Logs go to stderr.

use std::time::Duration;

use clap::Parser;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tracing::{debug, info, warn};

use switchyard_core::protocol::{
    self, ErrorObject, METHOD_ANALYZE, METHOD_INITIALIZE, METHOD_MESSAGE, METHOD_SHUTDOWN,
    METHOD_TOOL_CALL, Message, PROTOCOL_VERSION, Request, Response,
};
use switchyard_core::tracing_init::{crate_filter, init_tracing};

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;

#[derive(Parser, Debug)]
#[command(name = "switchyard-echo")]
#[command(version, about = "Reference worker for Switchyard: echoes requests back")]
struct Args {
    /// Tools this worker answers `tools/call` for (comma separated)
    #[arg(long, value_delimiter = ',')]
    tools: Vec<String>,

    /// Exit with this code shortly after answering the handshake
    #[arg(long)]
    exit_after_handshake: Option<i32>,

    /// Answer the handshake but no other request
    #[arg(long)]
    ignore_requests: bool,

    /// Delay before every non-handshake answer, in milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Log level filter
    #[arg(long, default_value = "warn")]
    log_level: String,
}

enum Step {
    Continue,
    Exit(i32),
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&crate_filter("switchyard-echo", &args.log_level), false);

    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ready = false;

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match protocol::decode_line(&line) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
                continue;
            }
        };

        match handle(&args, &mut stdout, message, &mut ready).await? {
            Step::Continue => {}
            Step::Exit(code) => {
                stdout.flush().await?;
                info!(code, "Exiting");
                std::process::exit(code);
            }
        }
    }

    info!("Input closed, exiting");
    Ok(())
}

async fn handle(
    args: &Args,
    stdout: &mut Stdout,
    message: Message,
    ready: &mut bool,
) -> anyhow::Result<Step> {
    match message {
        Message::Notification(note) if note.method == METHOD_SHUTDOWN => Ok(Step::Exit(0)),
        Message::Notification(note) => {
            debug!(method = %note.method, "Ignoring notification");
            Ok(Step::Continue)
        }
        Message::Response(resp) => {
            debug!(id = %resp.id, "Ignoring response");
            Ok(Step::Continue)
        }
        Message::Request(req) if req.method == METHOD_INITIALIZE => {
            let result = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {
                    "name": "switchyard-echo",
                    "version": env!("CARGO_PKG_VERSION"),
                },
                "tools": args.tools,
            });
            write(stdout, &Message::Response(Response::success(req.id, result))).await?;
            *ready = true;
            if let Some(code) = args.exit_after_handshake {
                // Let the handshake answer be read before the exit is observed.
                tokio::time::sleep(Duration::from_millis(100)).await;
                return Ok(Step::Exit(code));
            }
            Ok(Step::Continue)
        }
        Message::Request(req) => {
            if args.ignore_requests {
                debug!(method = %req.method, "Ignoring request");
                return Ok(Step::Continue);
            }
            if args.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(args.delay_ms)).await;
            }
            let response = if *ready {
                answer(args, req)
            } else {
                Response::failure(req.id, ErrorObject::new(INVALID_PARAMS, "handshake required"))
            };
            write(stdout, &Message::Response(response)).await?;
            Ok(Step::Continue)
        }
    }
}

fn answer(args: &Args, req: Request) -> Response {
    match req.method.as_str() {
        METHOD_MESSAGE | METHOD_ANALYZE => Response::success(req.id, req.params),
        METHOD_TOOL_CALL => {
            let name = req.params.get("name").and_then(Value::as_str);
            match name {
                Some(name) if args.tools.iter().any(|t| t == name) => {
                    Response::success(req.id, req.params)
                }
                Some(name) => Response::failure(
                    req.id,
                    ErrorObject::new(METHOD_NOT_FOUND, format!("unknown tool '{name}'")),
                ),
                None => Response::failure(
                    req.id,
                    ErrorObject::new(INVALID_PARAMS, "tools/call requires a name"),
                ),
            }
        }
        other => Response::failure(
            req.id,
            ErrorObject::new(METHOD_NOT_FOUND, format!("method not found: {other}")),
        ),
    }
}

async fn write(stdout: &mut Stdout, message: &Message) -> anyhow::Result<()> {
    let frame = protocol::encode(message)?;
    stdout.write_all(frame.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}
