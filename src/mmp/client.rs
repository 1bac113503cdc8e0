//! Client side of the manager protocol.
//!
//! One blocking connection per instance. Peer resolution may come back
//! pending while the rest of the simulation is still starting up; the
//! client absorbs that by polling with bounded exponential backoff, so
//! callers only ever see success or a final error.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::{PortDescription, Request, Response, ResultStatus};
use crate::error::{Error, Result};
use crate::logging::LogMessage;
use crate::model::Conduit;
use crate::reference::Reference;
use crate::settings::Configuration;
use crate::transport::MAX_FRAME_SIZE;

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Connection to the manager.
pub struct MMPClient {
    stream: TcpStream,
}

impl MMPClient {
    /// Connects to a manager at `host:port`.
    pub fn connect(location: &str) -> Result<MMPClient> {
        debug!("connecting to manager at {}", location);
        let stream = TcpStream::connect(location)?;
        stream.set_nodelay(true)?;
        Ok(MMPClient { stream })
    }

    /// Registers this instance's locations and declared ports.
    pub fn register_instance(
        &mut self,
        name: &Reference,
        locations: Vec<String>,
        ports: Vec<PortDescription>,
    ) -> Result<()> {
        let request = Request::RegisterInstance {
            instance_name: name.clone(),
            locations,
            ports,
        };
        match self.call(&request)? {
            Response::Register { status: ResultStatus::Success, .. } => Ok(()),
            Response::Register { error_message, .. } => Err(Error::Config(
                error_message
                    .unwrap_or_else(|| format!("registration of '{}' failed", name)),
            )),
            _ => Err(unexpected_response()),
        }
    }

    /// Resolves the conduits, peer dimensions and peer locations of the
    /// named instance, retrying while some peer has not registered yet.
    #[allow(clippy::type_complexity)]
    pub fn request_peers(
        &mut self,
        name: &Reference,
    ) -> Result<(
        Vec<Conduit>,
        HashMap<Reference, Vec<usize>>,
        HashMap<Reference, Vec<String>>,
    )> {
        let request = Request::RequestPeers { instance_name: name.clone() };
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match self.call(&request)? {
                Response::Peers {
                    status: ResultStatus::Success,
                    conduits,
                    peer_dimensions,
                    peer_locations,
                    ..
                } => {
                    let dims = peer_dimensions
                        .into_iter()
                        .map(|p| (p.peer_name, p.dimensions))
                        .collect();
                    let locations = peer_locations
                        .into_iter()
                        .map(|p| (p.instance_name, p.locations))
                        .collect();
                    return Ok((conduits, dims, locations));
                }
                Response::Peers { status: ResultStatus::Pending, .. } => {
                    debug!(
                        "peers of {} not yet available, retrying in {:?}",
                        name, backoff
                    );
                    thread::sleep(backoff);
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Response::Peers { .. } => {
                    return Err(Error::UnknownInstance(name.to_string()));
                }
                _ => return Err(unexpected_response()),
            }
        }
    }

    /// Fetches the model-wide base settings.
    pub fn get_configuration(&mut self) -> Result<Configuration> {
        match self.call(&Request::GetConfiguration)? {
            Response::Configuration(configuration) => Ok(configuration),
            _ => Err(unexpected_response()),
        }
    }

    /// Removes this instance from the manager's registry.
    pub fn deregister_instance(&mut self, name: &Reference) -> Result<()> {
        let request = Request::DeregisterInstance { instance_name: name.clone() };
        match self.call(&request)? {
            Response::Deregister { .. } => Ok(()),
            _ => Err(unexpected_response()),
        }
    }

    /// Forwards a log record to the manager's log sink.
    pub fn submit_log_message(&mut self, message: LogMessage) -> Result<()> {
        match self.call(&Request::SubmitLogMessage(message))? {
            Response::Log => Ok(()),
            _ => Err(unexpected_response()),
        }
    }

    pub fn close(&mut self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }

    fn call(&mut self, request: &Request) -> Result<Response> {
        let frame = bincode::serialize(request)?;
        self.stream.write_all(&(frame.len() as u32).to_le_bytes())?;
        self.stream.write_all(&frame)?;
        self.stream.flush()?;

        let mut len_bytes = [0u8; 4];
        self.stream.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(Error::Protocol(format!(
                "manager response frame too large: {} bytes",
                len
            )));
        }
        let mut data = vec![0u8; len];
        self.stream.read_exact(&mut data)?;
        Ok(bincode::deserialize(&data)?)
    }
}

fn unexpected_response() -> Error {
    Error::Protocol("unexpected response type from the manager".to_string())
}
