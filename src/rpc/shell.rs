//! Interactive shell: `op arg arg...` per line, through the same op table.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use super::dispatch;
use crate::camera::CameraSupervisor;
use crate::error::AppResult;

const PROMPT: &str = "camstack> ";

/// Split a shell line into an op and its arguments.
///
/// Each argument is read as JSON, falling back to a plain string.
pub fn parse_line(line: &str) -> Option<(String, Vec<Value>)> {
    let mut words = line.split_whitespace();
    let op = words.next()?.to_string();
    let args = words
        .map(|w| serde_json::from_str(w).unwrap_or_else(|_| Value::String(w.to_string())))
        .collect();
    Some((op, args))
}

/// Serve `input` until EOF, `quit` or `cancel`.
pub async fn run<R, W>(
    sup: &CameraSupervisor,
    input: R,
    mut output: W,
    cancel: CancellationToken,
) -> AppResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    loop {
        output.write_all(PROMPT.as_bytes()).await?;
        output.flush().await?;
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let Some((op, args)) = parse_line(&line) else {
            continue;
        };
        if op == "quit" || op == "exit" {
            break;
        }
        let text = match dispatch(sup, &op, &args).await {
            Ok(Value::Null) => "ok".to_string(),
            Ok(value) => serde_json::to_string_pretty(&value)?,
            Err(e) => format!("error: {e}"),
        };
        output.write_all(text.as_bytes()).await?;
        output.write_all(b"\n").await?;
    }
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn arguments_are_json_or_strings() {
        let (op, args) = parse_line("prm_setvalue 42 DETGAIN 0x00a1").unwrap();
        assert_eq!(op, "prm_setvalue");
        assert_eq!(args, vec![json!(42), json!("DETGAIN"), json!("0x00a1")]);

        let (_, args) = parse_line("set_camera_mode \"HALF\"").unwrap();
        assert_eq!(args, vec![json!("HALF")]);
        let (_, args) = parse_line("prm_getvalue null 161").unwrap();
        assert_eq!(args, vec![Value::Null, json!(161)]);
        assert!(parse_line("   ").is_none());
    }
}
