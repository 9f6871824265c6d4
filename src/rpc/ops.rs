//! Exported operation table.

use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::camera::CameraSupervisor;
use crate::error::{AppResult, CamstackError};
use crate::keywords::KeywordValue;
use crate::modes::{CameraMode, ModeId};

/// One operation of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpSpec {
    /// Wire name
    pub name: &'static str,
    /// Argument synopsis
    pub usage: &'static str,
    /// One-line description
    pub help: &'static str,
}

const fn op(name: &'static str, usage: &'static str, help: &'static str) -> OpSpec {
    OpSpec { name, usage, help }
}

/// Every operation, in help order.
pub const OPS: &[OpSpec] = &[
    op("state", "", "supervisor state"),
    op("health", "", "state, mode, worker, dependents and recorded faults"),
    op("get_camera_mode", "", "current mode id and window"),
    op("set_camera_mode", "<mode>", "reconfigure to a mode of the table"),
    op(
        "set_camera_size",
        "<height> <width> [h_offset] [w_offset]",
        "reconfigure to an explicit window",
    ),
    op("release", "", "stop polling, dependents and worker"),
    op("close", "", "same as release"),
    op("abort_exposure", "", "restart the worker with a short exposure"),
    op("set_keyword", "<key> <value>", "write a formatted header keyword"),
    op("get_keyword", "<key>", "read a header keyword"),
    op("keywords", "", "every header keyword"),
    op("modes", "", "mode table"),
    op("prm_getvalue", "<keyword|null> <id>", "read a worker parameter"),
    op("prm_setvalue", "<value> <keyword|null> <id>", "set a worker parameter"),
    op("dependents_status", "", "liveness of the dependents"),
    op("is_taker_running", "", "whether the acquisition worker runs"),
    op("get_tint", "", "exposure time (s)"),
    op("set_tint", "<seconds>", "set the exposure time"),
    op("get_fps", "", "frame rate (Hz)"),
    op("set_fps", "<hz>", "set the frame rate"),
    op("send_command", "<text> [timeout_s]", "serial command to the camera head"),
    op("help", "", "this table"),
];

/// Spec of operation `name`.
pub fn find(name: &str) -> Option<&'static OpSpec> {
    OPS.iter().find(|op| op.name == name)
}

fn bad_args(op: &str, why: impl std::fmt::Display) -> CamstackError {
    let usage = find(op).map(|o| o.usage).unwrap_or("");
    CamstackError::Rpc(format!("{op}: {why} (usage: {op} {usage})"))
}

fn arg<'a>(op: &str, args: &'a [Value], i: usize) -> AppResult<&'a Value> {
    args.get(i)
        .ok_or_else(|| bad_args(op, format!("missing argument {}", i + 1)))
}

fn arg_str(op: &str, args: &[Value], i: usize) -> AppResult<String> {
    match arg(op, args, i)? {
        Value::String(s) => Ok(s.clone()),
        other => Ok(other.to_string()),
    }
}

fn arg_opt_str(op: &str, args: &[Value], i: usize) -> AppResult<Option<String>> {
    match arg(op, args, i)? {
        Value::Null => Ok(None),
        Value::String(s) if s.is_empty() || s == "None" => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => Err(bad_args(op, format!("expected a keyword name, got {other}"))),
    }
}

fn arg_u32(op: &str, args: &[Value], i: usize) -> AppResult<u32> {
    let value = arg(op, args, i)?;
    let parsed = match value {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        },
        _ => None,
    };
    parsed.ok_or_else(|| bad_args(op, format!("expected an unsigned integer, got {value}")))
}

fn arg_u32_or(op: &str, args: &[Value], i: usize, default: u32) -> AppResult<u32> {
    if args.len() > i {
        arg_u32(op, args, i)
    } else {
        Ok(default)
    }
}

fn arg_f64(op: &str, args: &[Value], i: usize) -> AppResult<f64> {
    let value = arg(op, args, i)?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.ok_or_else(|| bad_args(op, format!("expected a number, got {value}")))
}

fn arg_keyword_value(op: &str, args: &[Value], i: usize) -> AppResult<KeywordValue> {
    match arg(op, args, i)? {
        Value::String(s) => Ok(KeywordValue::Str(s.clone())),
        other => serde_json::from_value(other.clone())
            .map_err(|e| bad_args(op, format!("bad value {other}: {e}"))),
    }
}

fn arg_mode(op: &str, args: &[Value], i: usize) -> AppResult<ModeId> {
    match arg(op, args, i)? {
        Value::Number(n) => n
            .as_i64()
            .map(ModeId::Index)
            .ok_or_else(|| bad_args(op, format!("bad mode index {n}"))),
        Value::String(s) => Ok(ModeId::parse(s)),
        other => Err(bad_args(op, format!("bad mode id {other}"))),
    }
}

fn mode_report(id: &ModeId, mode: &CameraMode) -> Value {
    let (width, height) = mode.binned_size();
    json!({
        "id": id,
        "window": mode,
        "width": width,
        "height": height,
        "description": mode.to_string(),
    })
}

/// Run `op` on `sup`.
pub async fn dispatch(sup: &CameraSupervisor, op: &str, args: &[Value]) -> AppResult<Value> {
    debug!(camera = %sup.name(), op, n_args = args.len(), "rpc call");
    let result = match op {
        "state" => json!(sup.state().await),
        "health" => serde_json::to_value(sup.health().await)?,
        "get_camera_mode" => match sup.get_camera_mode().await {
            Some((id, mode)) => mode_report(&id, &mode),
            None => Value::Null,
        },
        "set_camera_mode" => {
            sup.set_camera_mode(arg_mode(op, args, 0)?).await?;
            current_mode(sup).await
        }
        "set_camera_size" => {
            let height = arg_u32(op, args, 0)?;
            let width = arg_u32(op, args, 1)?;
            let h_offset = arg_u32_or(op, args, 2, 0)?;
            let w_offset = arg_u32_or(op, args, 3, 0)?;
            sup.set_camera_size(height, width, h_offset, w_offset).await?;
            current_mode(sup).await
        }
        "release" | "close" => {
            sup.release().await;
            Value::Null
        }
        "abort_exposure" => {
            sup.abort_exposure().await?;
            Value::Null
        }
        "set_keyword" => {
            let key = arg_str(op, args, 0)?;
            let value = arg_keyword_value(op, args, 1)?;
            json!(sup.set_keyword(&key, value).await?)
        }
        "get_keyword" => json!(sup.get_keyword(&arg_str(op, args, 0)?).await?),
        "keywords" => json!(sup.keywords().await?),
        "modes" => Value::Array(
            sup.modes()
                .await
                .iter()
                .map(|(id, mode)| mode_report(id, mode))
                .collect(),
        ),
        "prm_getvalue" => {
            let keyword = arg_opt_str(op, args, 0)?;
            let id = arg_u32(op, args, 1)?;
            json!(sup.prm_getvalue(keyword.as_deref(), id).await?)
        }
        "prm_setvalue" => {
            let value = arg_keyword_value(op, args, 0)?;
            let keyword = arg_opt_str(op, args, 1)?;
            let id = arg_u32(op, args, 2)?;
            json!(sup.prm_setvalue(keyword.as_deref(), id, value).await?)
        }
        "dependents_status" => serde_json::to_value(sup.dependents_status().await)?,
        "is_taker_running" => json!(sup.is_taker_running().await),
        "get_tint" => json!(sup.get_tint().await?),
        "set_tint" => json!(sup.set_tint(arg_f64(op, args, 0)?).await?),
        "get_fps" => json!(sup.get_fps().await?),
        "set_fps" => json!(sup.set_fps(arg_f64(op, args, 0)?).await?),
        "send_command" => {
            let text = arg_str(op, args, 0)?;
            let timeout = if args.len() > 1 {
                arg_f64(op, args, 1)?
            } else {
                1.0
            };
            let timeout = Duration::try_from_secs_f64(timeout)
                .map_err(|e| bad_args(op, format!("bad timeout: {e}")))?;
            json!(sup.send_command(&text, timeout).await?)
        }
        "help" => Value::Array(
            OPS.iter()
                .map(|o| json!({"op": o.name, "usage": o.usage, "help": o.help}))
                .collect(),
        ),
        other => return Err(CamstackError::Rpc(format!("unknown operation '{other}'"))),
    };
    Ok(result)
}

async fn current_mode(sup: &CameraSupervisor) -> Value {
    match sup.get_camera_mode().await {
        Some((id, mode)) => mode_report(&id, &mode),
        None => Value::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_ids_accept_hex() {
        let args = vec![json!("0x001F0110"), json!(161), json!(-1)];
        assert_eq!(arg_u32("prm_getvalue", &args, 0).unwrap(), 0x001F_0110);
        assert_eq!(arg_u32("prm_getvalue", &args, 1).unwrap(), 161);
        assert!(arg_u32("prm_getvalue", &args, 2).is_err());
        assert!(arg_u32("prm_getvalue", &args, 3).is_err());
    }

    #[test]
    fn keyword_values_keep_their_json_type() {
        let args = vec![json!(42), json!(0.5), json!("ND1"), json!(true)];
        assert_eq!(arg_keyword_value("x", &args, 0).unwrap(), KeywordValue::Int(42));
        assert_eq!(arg_keyword_value("x", &args, 1).unwrap(), KeywordValue::Float(0.5));
        assert_eq!(
            arg_keyword_value("x", &args, 2).unwrap(),
            KeywordValue::Str("ND1".into())
        );
        assert_eq!(arg_keyword_value("x", &args, 3).unwrap(), KeywordValue::Bool(true));
    }

    #[test]
    fn every_listed_op_is_unique() {
        let mut names: Vec<_> = OPS.iter().map(|o| o.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), OPS.len());
        assert!(find("set_camera_mode").is_some());
        assert_eq!(arg_mode("m", &[json!(3)], 0).unwrap(), ModeId::Index(3));
        assert_eq!(arg_mode("m", &[json!("HALF")], 0).unwrap(), ModeId::from("HALF"));
    }
}
