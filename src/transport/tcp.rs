//! TCP transport.
//!
//! The server side runs a tokio accept loop on a dedicated background
//! thread, one task per connection. A connection speaks a simple
//! request/response protocol: the client sends the receiver endpoint it
//! wants a message for, the server answers with the next message from
//! the matching outbox, blocking server-side until one is available.
//! All frames are length-prefixed (four bytes, little endian).
//!
//! The client side is deliberately synchronous; receiving is a blocking
//! operation in the instance's own thread.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::{debug, error};

use super::{TransportClient, TransportServer, MAX_FRAME_SIZE};
use crate::error::{Error, Result};
use crate::post_office::PostOffice;
use crate::reference::Reference;

/// Serves one instance's post office over TCP.
pub struct TcpTransportServer {
    location: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TcpTransportServer {
    /// Binds to an ephemeral port and starts serving in the background.
    pub fn start(post_office: Arc<PostOffice>) -> Result<TcpTransportServer> {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (addr_tx, addr_rx) = mpsc::channel::<std::io::Result<SocketAddr>>();

        let handle = thread::Builder::new()
            .name("tcp-transport-server".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Runtime::new() {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        let _ = addr_tx.send(Err(e));
                        return;
                    }
                };
                runtime.block_on(Self::serve(post_office, addr_tx, shutdown_rx));
                // Pending retrievals may be parked on empty outboxes;
                // do not wait for them when shutting down.
                runtime.shutdown_background();
            })?;

        let address = addr_rx
            .recv()
            .map_err(|_| {
                Error::Config("transport server thread exited before binding".to_string())
            })??;

        debug!("TCP transport server listening on {}", address);
        Ok(TcpTransportServer {
            location: format!("tcp:{}", address),
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    async fn serve(
        post_office: Arc<PostOffice>,
        addr_tx: mpsc::Sender<std::io::Result<SocketAddr>>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) {
        let listener = match TcpListener::bind("127.0.0.1:0").await {
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
                        debug!("accepted transport connection from {}", peer);
                        tokio::spawn(Self::handle_connection(stream, post_office.clone()));
                    }
                    Err(e) => {
                        error!("failed to accept transport connection: {}", e);
                        break;
                    }
                }
            }
        }
    }

    async fn handle_connection(mut stream: TcpStream, post_office: Arc<PostOffice>) {
        let _ = stream.set_nodelay(true);
        loop {
            // A read failure here is the peer hanging up, which is how
            // connections end; not an error worth reporting.
            let receiver = match Self::read_request(&mut stream).await {
                Ok(receiver) => receiver,
                Err(_) => break,
            };
            post_office.serving_started();
            let po = post_office.clone();
            let message =
                match tokio::task::spawn_blocking(move || po.retrieve(&receiver)).await {
                    Ok(Ok(message)) => message,
                    _ => {
                        post_office.serving_done();
                        break;
                    }
                };
            let written = Self::write_response(&mut stream, &message).await;
            post_office.serving_done();
            if let Err(e) = written {
                debug!("transport connection closed while responding: {}", e);
                break;
            }
        }
    }

    async fn read_request(stream: &mut TcpStream) -> Result<Reference> {
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

    async fn write_response(stream: &mut TcpStream, message: &[u8]) -> Result<()> {
        stream.write_all(&(message.len() as u32).to_le_bytes()).await?;
        stream.write_all(message).await?;
        stream.flush().await?;
        Ok(())
    }
}

impl TransportServer for TcpTransportServer {
    fn location(&self) -> String {
        self.location.clone()
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpTransportServer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Blocking client for one peer's transport server.
pub struct TcpTransportClient {
    stream: std::net::TcpStream,
}

impl TcpTransportClient {
    pub fn can_connect_to(location: &str) -> bool {
        location.starts_with("tcp:")
    }

    pub fn connect(location: &str) -> Result<TcpTransportClient> {
        let address = location.strip_prefix("tcp:").ok_or_else(|| {
            Error::Config(format!("'{}' is not a TCP transport address", location))
        })?;
        let stream = std::net::TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        Ok(TcpTransportClient { stream })
    }
}

impl TransportClient for TcpTransportClient {
    fn get_message(&mut self, receiver: &Reference) -> Result<Vec<u8>> {
        let request = bincode::serialize(receiver)?;
        self.stream.write_all(&(request.len() as u32).to_le_bytes())?;
        self.stream.write_all(&request)?;
        self.stream.flush()?;

        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "response frame too large: {} bytes",
                len
            )));
        }
        let mut data = vec![0u8; len];
        self.stream.read_exact(&mut data)?;
        Ok(data)
    }

    fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}
