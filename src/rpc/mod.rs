//! JSON-RPC 2.0 over TCP.
//!
//! - `protocol`: request/response types and error codes
//! - `transport`: listener with newline-delimited JSON framing
//! - `methods`: method dispatch into the job service and registry
//! - `client`: what the CLI uses to talk to a running daemon

pub mod client;
pub mod methods;
mod protocol;
mod transport;

use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;

use crate::context::AppContext;
use transport::Transport;

pub use client::{ClientError, RpcClient};
pub use methods::MethodHandler;
pub use protocol::{JOB_NOT_FOUND, Request, Response, RpcError};

pub struct RpcServer {
    transport: Transport,
    shutdown: CancellationToken,
}

impl RpcServer {
    /// Bind to `config.rpc_bind`. The server stops when the context's
    /// shutdown token is cancelled.
    pub async fn bind(ctx: AppContext) -> anyhow::Result<Self> {
        let shutdown = ctx.shutdown.clone();
        let addr = ctx.config.rpc_bind;
        let transport = Transport::bind(addr, MethodHandler::new(ctx)).await?;
        Ok(Self {
            transport,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub async fn serve(&self) -> anyhow::Result<()> {
        self.transport.serve(self.shutdown.clone()).await
    }
}
