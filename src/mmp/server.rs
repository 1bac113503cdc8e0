//! Server side of the manager protocol.
//!
//! A tokio accept loop on a background thread, one task per connected
//! instance. Requests dispatch into [`Manager`], which serializes access
//! to its registry internally, so connection tasks stay independent.

use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

use super::Request;
use crate::error::{Error, Result};
use crate::manager::Manager;
use crate::transport::MAX_FRAME_SIZE;

/// The manager's RPC server.
pub struct MMPServer {
    location: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl MMPServer {
    /// Binds to `bind` (use port 0 for an ephemeral port) and starts
    /// serving requests against the given manager.
    pub fn start(manager: Arc<Manager>, bind: &str) -> Result<MMPServer> {
        let bind = bind.to_string();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (addr_tx, addr_rx) = mpsc::channel::<std::io::Result<SocketAddr>>();

        let handle = thread::Builder::new()
            .name("mmp-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Runtime::new() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = addr_tx.send(Err(e));
                        return;
                    }
                };
                runtime.block_on(Self::serve(manager, bind, addr_tx, shutdown_rx));
                runtime.shutdown_background();
            })?;

        let address = addr_rx
            .recv()
            .map_err(|_| Error::Config("manager server thread exited before binding".to_string()))??;

        info!("manager listening on {}", address);
        Ok(MMPServer {
            location: address.to_string(),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// The `host:port` instances should pass as their manager location.
    pub fn location(&self) -> String {
        self.location.clone()
    }

    pub fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    async fn serve(
        manager: Arc<Manager>,
        bind: String,
        addr_tx: mpsc::Sender<std::io::Result<SocketAddr>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = addr_tx.send(Err(e));
                return;
            }
        };
        let address = match listener.local_addr() {
            Ok(address) => address,
            Err(e) => {
                let _ = addr_tx.send(Err(e));
                return;
            }
        };
        let _ = addr_tx.send(Ok(address));

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("instance connected from {}", peer);
                        tokio::spawn(Self::handle_connection(stream, manager.clone()));
                    }
                    Err(e) => {
                        error!("failed to accept manager connection: {}", e);
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(mut stream: TcpStream, manager: Arc<Manager>) {
        let _ = stream.set_nodelay(true);
        loop {
            let request = match Self::read_request(&mut stream).await {
                Ok(request) => request,
                // The instance hung up; that is how connections end.
                Err(_) => break,
            };
            let response = manager.handle(request);
            let frame = match bincode::serialize(&response) {
                Ok(frame) => frame,
                Err(e) => {
                    error!("failed to encode manager response: {}", e);
                    break;
                }
            };
            if Self::write_frame(&mut stream, &frame).await.is_err() {
                break;
            }
        }
    }

    async fn read_request(stream: &mut TcpStream) -> Result<Request> {
        let mut len_bytes = [0u8; 4];
        stream.read_exact(&mut len_bytes).await?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!("request frame too large: {} bytes", len)));
        }
        let mut data = vec![0u8; len];
        stream.read_exact(&mut data).await?;
        Ok(bincode::deserialize(&data)?)
    }

    async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> Result<()> {
        stream.write_all(&(frame.len() as u32).to_le_bytes()).await?;
        stream.write_all(frame).await?;
        stream.flush().await?;
        Ok(())
    }
}

impl Drop for MMPServer {
    fn drop(&mut self) {
        self.stop();
    }
}
