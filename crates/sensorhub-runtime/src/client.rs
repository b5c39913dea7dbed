//! Control-socket client for the CLI subcommands.

use std::path::Path;

use anyhow::Context;
use sensorhub_core::SampleKind;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use crate::cli::ListenOpts;

pub(crate) async fn rpc_call(socket_path: &Path, method: &str, params: Value) -> anyhow::Result<Value> {
    let stream = UnixStream::connect(socket_path)
        .await
        .map_err(|e| anyhow::anyhow!("cannot connect to daemon at {}: {e}", socket_path.display()))?;

    let (reader, mut writer) = stream.into_split();

    let request = json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
        "id": 1,
    });
    let mut req = serde_json::to_string(&request)?;
    req.push('\n');
    writer.write_all(req.as_bytes()).await?;
    writer.shutdown().await?;

    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    reader.read_line(&mut line).await?;

    let response: Value = serde_json::from_str(line.trim())?;

    if let Some(error) = response.get("error") {
        anyhow::bail!("RPC error: {error}");
    }

    Ok(response["result"].clone())
}

/// `sensorhubd channels`: pretty-printed channel list.
pub async fn cmd_channels(socket_path: &Path) -> anyhow::Result<()> {
    let result = rpc_call(socket_path, "list_channels", Value::Null).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// `sensorhubd standby` / `sensorhubd resume`.
pub async fn cmd_power(socket_path: &Path, method: &str) -> anyhow::Result<()> {
    let result = rpc_call(socket_path, method, Value::Null).await?;
    let changed = result
        .as_object()
        .and_then(|o| o.values().next())
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(" "))
        .unwrap_or_default();
    if changed.is_empty() {
        println!("{method}: no channel changed");
    } else {
        println!("{method}: {changed}");
    }
    Ok(())
}

/// `sensorhubd listen <channel>`: open a session, print samples, close it.
pub async fn cmd_listen(socket_path: &Path, opts: &ListenOpts) -> anyhow::Result<()> {
    let ticket = rpc_call(socket_path, "open_session", json!({ "channel": opts.channel })).await?;
    let session = ticket["session"]
        .as_i64()
        .and_then(|v| i32::try_from(v).ok())
        .context("daemon returned no session id")?;

    let outcome = tokio::select! {
        r = listen_session(socket_path, &ticket, session, opts) => r,
        _ = tokio::signal::ctrl_c() => Ok(()),
    };

    if let Err(e) = rpc_call(socket_path, "close_session", json!({ "session": session })).await {
        eprintln!("failed to close session {session}: {e}");
    }
    outcome
}

async fn listen_session(
    socket_path: &Path,
    ticket: &Value,
    session: i32,
    opts: &ListenOpts,
) -> anyhow::Result<()> {
    let kind: SampleKind =
        serde_json::from_value(ticket["sample"].clone()).context("unknown sample kind")?;
    let preamble = ticket["preamble"].as_str().unwrap_or_default();
    let data_socket = ticket["data_socket"]
        .as_str()
        .context("daemon returned no data socket")?;

    if let Some(ms) = opts.interval_ms {
        let r = rpc_call(socket_path, "set_interval", json!({ "session": session, "interval_ms": ms })).await?;
        eprintln!("effective interval: {} ms", r["effective_interval_ms"]);
    }
    if let Some(batch) = opts.batch {
        rpc_call(
            socket_path,
            "configure_session",
            json!({ "session": session, "batch_samples": batch, "batch_timeout_ms": 1000 }),
        )
        .await?;
    }

    let mut stream = UnixStream::connect(data_socket)
        .await
        .with_context(|| format!("cannot connect to data socket {data_socket}"))?;
    let mut got = vec![0u8; preamble.len()];
    stream.read_exact(&mut got).await.context("reading preamble")?;
    if got != preamble.as_bytes() {
        anyhow::bail!("unexpected preamble {:?}", String::from_utf8_lossy(&got));
    }
    stream.write_all(&session.to_le_bytes()).await?;

    rpc_call(socket_path, "start", json!({ "session": session })).await?;

    let mut record = vec![0u8; kind.wire_size()];
    let mut seen = 0usize;
    while opts.count.is_none_or(|n| seen < n) {
        match stream.read_exact(&mut record).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                eprintln!("daemon closed the session");
                break;
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(line) = format_sample(kind, &record) {
            println!("{line}");
        }
        seen += 1;
    }
    Ok(())
}

/// Render one wire record. `None` if `record` has the wrong size.
pub(crate) fn format_sample(kind: SampleKind, record: &[u8]) -> Option<String> {
    if record.len() != kind.wire_size() {
        return None;
    }
    let ts = u64::from_le_bytes(record[0..8].try_into().ok()?);
    let word = |at: usize| -> Option<[u8; 4]> { record[at..at + 4].try_into().ok() };
    Some(match kind {
        SampleKind::Unsigned => format!("{ts} {}", u32::from_le_bytes(word(8)?)),
        SampleKind::Xyz => format!(
            "{ts} {} {} {}",
            i32::from_le_bytes(word(8)?),
            i32::from_le_bytes(word(12)?),
            i32::from_le_bytes(word(16)?)
        ),
        SampleKind::Proximity => format!(
            "{ts} {} {}",
            u32::from_le_bytes(word(8)?),
            if record[12] != 0 { "near" } else { "far" }
        ),
    })
}
