use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use std::{sync::Arc, time::Duration};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::Semaphore,
    time::{sleep, timeout},
};

use crate::device::Device;
use crate::regs::Reg;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// `host:port` to listen on
    pub addr: String,
    pub max_connections: usize,
    /// Most request bytes read before polling; the content is ignored
    pub request_budget: usize,
    pub request_timeout: Duration,
    /// Pause before the listener is rebuilt after a failure
    pub restart_delay: Duration,
}

impl ServerConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        ServerConfig {
            addr: addr.into(),
            max_connections: 16,
            request_budget: 1024,
            request_timeout: Duration::from_secs(10),
            restart_delay: Duration::from_secs(5),
        }
    }
}

/// Answers every connection with one JSON snapshot of the configured
/// registers, then closes it.
#[derive(Debug, Clone)]
pub struct TelemetryServer {
    device: Device,
    regs: Arc<[Reg]>,
    config: Arc<ServerConfig>,
}

impl TelemetryServer {
    pub fn new(device: Device, regs: Vec<Reg>, config: ServerConfig) -> Self {
        TelemetryServer {
            device,
            regs: regs.into(),
            config: Arc::new(config),
        }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind(&self.config.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.addr))?;
        info!(
            "serving {} {} registers on {}",
            self.regs.len(),
            self.device.kind(),
            listener.local_addr()?
        );
        Ok(listener)
    }

    /// Accepts connections until the listener fails. Each connection runs in
    /// its own task; at most `max_connections` run at once.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let limit = Arc::new(Semaphore::new(self.config.max_connections));
        loop {
            let permit = limit.clone().acquire_owned().await?;
            let (stream, peer) = listener.accept().await.context("accept failed")?;
            debug!("connection from {}", peer);
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.handle(stream).await {
                    warn!("{}: {:#}", peer, e);
                }
                drop(permit);
            });
        }
    }

    /// Serves one client: wait for a request (or EOF), poll, reply, close.
    pub async fn handle(&self, mut stream: TcpStream) -> Result<()> {
        let mut request = vec![0u8; self.config.request_budget];
        let n = match timeout(self.config.request_timeout, stream.read(&mut request)).await {
            Ok(res) => res.context("failed to read request")?,
            Err(_) => {
                debug!("no request within {:?}", self.config.request_timeout);
                return Ok(());
            }
        };
        debug!("request {:?}", String::from_utf8_lossy(&request[..n]));

        let result = self.device.poll(&self.regs).await?;
        let body = json::stringify(result.to_json());
        stream
            .write_all(body.as_bytes())
            .await
            .context("failed to send reply")?;
        stream.shutdown().await?;
        Ok(())
    }

    /// Keeps a listener up forever, rebuilding it after any failure.
    pub async fn run(&self) {
        loop {
            match self.bind().await {
                Ok(listener) => {
                    if let Err(e) = self.serve(listener).await {
                        error!("{:?}", e);
                    }
                }
                Err(e) => error!("{:?}", e),
            }
            info!("restarting listener in {:?}", self.config.restart_delay);
            sleep(self.config.restart_delay).await;
        }
    }
}
