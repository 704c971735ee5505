//! Client side of the daemon's RPC interface.

use std::net::SocketAddr;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::protocol::{Request, Response, RpcError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Failed to connect to daemon: {0}")]
    Connect(#[source] std::io::Error),
    #[error("Communication error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Daemon closed the connection without answering")]
    NoResponse,
    #[error("RPC error {}: {}", .0.code, .0.message)]
    Rpc(RpcError),
}

pub struct RpcClient {
    addr: SocketAddr,
}

impl RpcClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// One request, one response, one connection.
    pub async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: impl Serialize,
    ) -> Result<T, ClientError> {
        let stream = TcpStream::connect(self.addr)
            .await
            .map_err(ClientError::Connect)?;
        let (reader, mut writer) = stream.into_split();

        let params = match serde_json::to_value(params)? {
            Value::Null => None,
            v => Some(v),
        };
        let mut line = serde_json::to_vec(&Request::new(method, params, 1))?;
        line.push(b'\n');
        writer.write_all(&line).await?;

        let mut lines = BufReader::new(reader).lines();
        let reply = lines.next_line().await?.ok_or(ClientError::NoResponse)?;
        let response: Response = serde_json::from_str(&reply)?;

        if let Some(error) = response.error {
            return Err(ClientError::Rpc(error));
        }
        Ok(serde_json::from_value(response.result.unwrap_or(Value::Null))?)
    }
}
