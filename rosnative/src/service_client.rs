//! Service calling over TCPROS.
//!
//! A client resolves the provider through the master, performs the handshake,
//! then exchanges one request body for one status byte plus response body per
//! call. A persistent client keeps the connection for the next call; otherwise
//! every call opens a fresh one.

use crate::master_client::MasterClient;
use crate::tcpros::{self, ConnectionHeader, SERVICE_OK};
use anyhow::anyhow;
use log::*;
use rosnative_common::{Error, Result, RosServiceType};
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};

/// The typed service client handle.
///
/// Calls are serialized: the handle holds at most one connection and one
/// in-flight exchange at a time.
pub struct ServiceClient<S> {
    abs_service: String,
    caller_id: String,
    persistent: bool,
    master: Arc<MasterClient>,
    conn: Mutex<Option<TcpStream>>,
    shutdown: watch::Receiver<bool>,
    phantom: PhantomData<S>,
}

impl<S: RosServiceType> ServiceClient<S> {
    pub(crate) fn new(
        abs_service: String,
        caller_id: String,
        persistent: bool,
        master: Arc<MasterClient>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        ServiceClient {
            abs_service,
            caller_id,
            persistent,
            master,
            conn: Mutex::new(None),
            shutdown,
            phantom: PhantomData,
        }
    }

    pub fn service(&self) -> &str {
        &self.abs_service
    }

    /// Performs one request/response exchange.
    ///
    /// Mid-call provider shutdown surfaces as [Error::TransportClosed]; node
    /// shutdown as [Error::Cancelled].
    pub async fn call(&self, request: &S::Request) -> Result<S::Response> {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return Err(Error::Cancelled);
        }
        tokio::select! {
            _ = shutdown.changed() => Err(Error::Cancelled),
            result = self.call_inner(request) => result,
        }
    }

    async fn call_inner(&self, request: &S::Request) -> Result<S::Response> {
        let encoded = serde_rosmsg::to_vec(request)
            .map_err(|e| Error::Serialization(format!("failed to encode request: {e}")))?;

        let mut guard = self.conn.lock().await;
        let mut stream = match guard.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };
        let result = Self::exchange(&mut stream, &encoded).await;
        if result.is_ok() && self.persistent {
            *guard = Some(stream);
        }
        result
    }

    /// Looks the provider up at the master and performs the handshake.
    async fn connect(&self) -> Result<TcpStream> {
        let uri = self.master.lookup_service(&self.abs_service).await?;
        let address = parse_rosrpc_uri(&uri)?;
        let mut stream = TcpStream::connect(&address).await?;

        let request = ConnectionHeader {
            caller_id: self.caller_id.clone(),
            service: Some(self.abs_service.clone()),
            topic_type: S::ROS_SERVICE_NAME.to_owned(),
            md5sum: Some(S::MD5SUM.to_owned()),
            persistent: Some(self.persistent),
            ..Default::default()
        };
        tcpros::write_header(&mut stream, &request).await?;
        let reply = tcpros::read_header(&mut stream).await?;
        if let Some(error) = reply.error {
            return Err(Error::HandshakeMismatch(error));
        }
        if let Some(md5sum) = &reply.md5sum {
            if md5sum != "*" && md5sum != S::MD5SUM {
                return Err(Error::HandshakeMismatch(format!(
                    "md5sums do not match, expected {} received {md5sum}",
                    S::MD5SUM
                )));
            }
        }
        debug!("Connected to service provider for {}", self.abs_service);
        Ok(stream)
    }

    async fn exchange(stream: &mut TcpStream, encoded: &[u8]) -> Result<S::Response> {
        stream
            .write_all(encoded)
            .await
            .map_err(tcpros::map_io_err)?;

        let mut status = [0u8; 1];
        stream
            .read_exact(&mut status)
            .await
            .map_err(tcpros::map_io_err)?;
        if status[0] == SERVICE_OK {
            let body = tcpros::read_body(stream).await?;
            serde_rosmsg::from_slice(&body)
                .map_err(|e| Error::Serialization(format!("failed to decode response: {e}")))
        } else {
            let message = tcpros::read_frame(stream, tcpros::MAX_HEADER_LEN).await?;
            Err(Error::Unexpected(anyhow!(
                "service call failed: {}",
                String::from_utf8_lossy(&message)
            )))
        }
    }
}

/// Parses `rosrpc://host:port` into `host:port`.
fn parse_rosrpc_uri(uri: &str) -> Result<String> {
    let rest = uri
        .strip_prefix("rosrpc://")
        .ok_or_else(|| Error::Malformed(format!("not a rosrpc uri: {uri}")))?;
    let rest = rest.trim_end_matches('/');
    if rest.is_empty() || !rest.contains(':') {
        return Err(Error::Malformed(format!("not a rosrpc uri: {uri}")));
    }
    Ok(rest.to_owned())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rosrpc_uri_parses() {
        assert_eq!(
            parse_rosrpc_uri("rosrpc://10.0.0.5:38291").unwrap(),
            "10.0.0.5:38291"
        );
        assert_eq!(
            parse_rosrpc_uri("rosrpc://localhost:1234/").unwrap(),
            "localhost:1234"
        );
        assert!(parse_rosrpc_uri("http://localhost:1234").is_err());
        assert!(parse_rosrpc_uri("rosrpc://").is_err());
    }
}
