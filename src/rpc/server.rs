//! JSON-lines TCP server and one-shot client.

use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{dispatch, RpcRequest, RpcResponse};
use crate::camera::CameraSupervisor;
use crate::error::{AppResult, CamstackError};

/// Answer one request line.
pub async fn handle_line(sup: &CameraSupervisor, line: &str) -> RpcResponse {
    let request: RpcRequest = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => return RpcResponse::error(0, format!("malformed request: {e}")),
    };
    match dispatch(sup, &request.op, &request.args).await {
        Ok(result) => RpcResponse::ok(request.id, result),
        Err(e) => {
            warn!(op = %request.op, "rpc call failed: {e}");
            RpcResponse::error(request.id, e.to_string())
        }
    }
}

/// Line-delimited JSON server over TCP.
pub struct RpcServer {
    listener: TcpListener,
}

impl RpcServer {
    /// Listen on `addr`.
    pub async fn bind(addr: &str) -> AppResult<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    /// Bound address.
    pub fn local_addr(&self) -> AppResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires. Each connection is served by
    /// its own task; calls still serialize on the supervisor lock.
    pub async fn run(self, sup: CameraSupervisor, cancel: CancellationToken) -> AppResult<()> {
        info!(addr = %self.local_addr()?, camera = %sup.name(), "rpc server listening");
        loop {
            let (socket, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted?,
            };
            debug!(%peer, "rpc client connected");
            let sup = sup.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = serve_connection(sup, socket, cancel).await {
                    error!(%peer, "rpc connection failed: {e}");
                }
            });
        }
        info!("rpc server stopped");
        Ok(())
    }
}

async fn serve_connection(
    sup: CameraSupervisor,
    socket: TcpStream,
    cancel: CancellationToken,
) -> AppResult<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&sup, &line).await;
        let mut out = serde_json::to_string(&response)?;
        out.push('\n');
        writer.write_all(out.as_bytes()).await?;
    }
    Ok(())
}

/// Send one request to a supervisor at `addr` and wait for the answer.
pub async fn call(addr: &str, op: &str, args: Vec<serde_json::Value>) -> AppResult<RpcResponse> {
    let socket = TcpStream::connect(addr).await?;
    let (reader, mut writer) = socket.into_split();
    let request = RpcRequest {
        id: 1,
        op: op.to_string(),
        args,
    };
    let mut line = serde_json::to_string(&request)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;

    let mut lines = BufReader::new(reader).lines();
    let answer = lines
        .next_line()
        .await?
        .ok_or_else(|| CamstackError::Rpc(format!("{addr} closed the connection")))?;
    Ok(serde_json::from_str(&answer)?)
}
