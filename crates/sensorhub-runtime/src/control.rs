//! Control socket: newline-delimited JSON-RPC, one request per connection.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use sensorhub_session::SessionConfig;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

use crate::context::HubContext;

const METHOD_NOT_FOUND: i64 = -32601;
const INVALID_PARAMS: i64 = -32602;
const SERVER_ERROR: i64 = -32000;

/// Run the control server until the listener fails.
pub async fn run_control_server(socket_path: &Path, ctx: Arc<HubContext>) -> anyhow::Result<()> {
    let socket_dir = socket_path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid socket path"))?;

    std::fs::create_dir_all(socket_dir)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_dir, std::fs::Permissions::from_mode(0o700))?;
    }

    if socket_path.exists() {
        if tokio::net::UnixStream::connect(socket_path).await.is_err() {
            std::fs::remove_file(socket_path)?;
            tracing::info!("removed stale control socket at {}", socket_path.display());
        } else {
            anyhow::bail!("another daemon is already running at {}", socket_path.display());
        }
    }

    let listener = UnixListener::bind(socket_path)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(socket_path, std::fs::Permissions::from_mode(0o600))?;
    }

    tracing::info!("control socket listening on {}", socket_path.display());

    loop {
        let (stream, _) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, ctx).await {
                tracing::debug!("control connection error: {e}");
            }
        });
    }
}

async fn handle_connection(stream: tokio::net::UnixStream, ctx: Arc<HubContext>) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let request: Value = serde_json::from_str(line.trim())?;
    let response = handle_request(&ctx, &request);

    let mut resp = serde_json::to_string(&response)?;
    resp.push('\n');
    writer.write_all(resp.as_bytes()).await?;
    Ok(())
}

/// Build the JSON-RPC response for one request.
pub(crate) fn handle_request(ctx: &HubContext, request: &Value) -> Value {
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or("");
    let params = &request["params"];

    match dispatch(ctx, method, params) {
        Ok(result) => json!({
            "jsonrpc": "2.0",
            "result": result,
            "id": id,
        }),
        Err(RpcError { code, message }) => json!({
            "jsonrpc": "2.0",
            "error": {"code": code, "message": message},
            "id": id,
        }),
    }
}

struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for RpcError {
    fn from(e: anyhow::Error) -> Self {
        Self {
            code: SERVER_ERROR,
            message: format!("{e:#}"),
        }
    }
}

fn dispatch(ctx: &HubContext, method: &str, params: &Value) -> Result<Value, RpcError> {
    match method {
        "list_channels" => Ok(json!({
            "channels": ctx.list_channels(),
            "buffers": ctx.registry().names(),
            "sessions": ctx.session_ids(),
        })),
        "open_session" => {
            let channel = str_param(params, "channel")?;
            let requested = match params.get("session") {
                None | Some(Value::Null) => None,
                Some(_) => Some(session_param(params)?),
            };
            let ticket = ctx.open_session(channel, requested)?;
            Ok(json!(ticket))
        }
        "close_session" => {
            let id = session_param(params)?;
            Ok(json!({ "closed": ctx.close_session(id) }))
        }
        "start" => {
            ctx.start_session(session_param(params)?)?;
            Ok(json!({ "started": true }))
        }
        "stop" => {
            ctx.stop_session(session_param(params)?)?;
            Ok(json!({ "stopped": true }))
        }
        "set_interval" => {
            let id = session_param(params)?;
            let ms = u32_param(params, "interval_ms")?;
            let effective = ctx.set_interval(id, ms)?;
            Ok(json!({ "effective_interval_ms": effective }))
        }
        "configure_session" => {
            let id = session_param(params)?;
            let config = SessionConfig {
                min_interval: Duration::from_millis(opt_u64(params, "min_interval_ms")?),
                batch_samples: usize::try_from(opt_u64(params, "batch_samples")?)
                    .map_err(|_| RpcError::invalid("batch_samples out of range"))?,
                batch_timeout: Duration::from_millis(opt_u64(params, "batch_timeout_ms")?),
            };
            ctx.configure_session(id, config)?;
            Ok(json!({ "configured": true }))
        }
        "standby" => Ok(json!({ "entered": ctx.standby_all() })),
        "resume" => Ok(json!({ "resumed": ctx.resume_all() })),
        "set_standby_override" => {
            let channel = str_param(params, "channel")?;
            let enabled = params["enabled"]
                .as_bool()
                .ok_or_else(|| RpcError::invalid("missing boolean `enabled`"))?;
            ctx.set_standby_override(channel, enabled)?;
            Ok(json!({ "channel": channel, "standby_override": enabled }))
        }
        _ => Err(RpcError {
            code: METHOD_NOT_FOUND,
            message: "method not found".to_string(),
        }),
    }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, RpcError> {
    params[key]
        .as_str()
        .ok_or_else(|| RpcError::invalid(format!("missing string `{key}`")))
}

fn session_param(params: &Value) -> Result<i32, RpcError> {
    params["session"]
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .ok_or_else(|| RpcError::invalid("missing or invalid `session`"))
}

fn u32_param(params: &Value, key: &str) -> Result<u32, RpcError> {
    params[key]
        .as_u64()
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| RpcError::invalid(format!("missing or invalid `{key}`")))
}

fn opt_u64(params: &Value, key: &str) -> Result<u64, RpcError> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(0),
        Some(v) => v
            .as_u64()
            .ok_or_else(|| RpcError::invalid(format!("invalid `{key}`"))),
    }
}
