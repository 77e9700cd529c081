//! Service providing: the `ServiceProvider` handle and the per-service actor.
//!
//! A provider mirrors a publication without latching or pushes: every inbound
//! connection is a request stream where each request body produces exactly one
//! status byte and one response body (or error string).

use crate::master_client::MasterClient;
use crate::node::actor::NodeMsg;
use crate::tcpros::{self, ConnectionHeader, SERVICE_ERROR, SERVICE_OK};
use abort_on_drop::ChildTask;
use log::*;
use rosnative_common::Error;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

pub(crate) const PROVIDER_INBOX: usize = 64;

/// Type-erased request handler: takes an encoded request body (length prefix
/// included), returns an encoded response body or an error string.
pub(crate) type ServiceHandler =
    Arc<dyn Fn(Vec<u8>) -> std::result::Result<Vec<u8>, String> + Send + Sync>;

pub(crate) enum ProviderMsg {
    ClientNew {
        stream: TcpStream,
        header: ConnectionHeader,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// The handle returned by advertising a service.
pub struct ServiceProvider {
    service: String,
    sender: mpsc::Sender<ProviderMsg>,
}

impl ServiceProvider {
    pub(crate) fn new(service: &str, sender: mpsc::Sender<ProviderMsg>) -> Self {
        ServiceProvider {
            service: service.to_owned(),
            sender,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Closes the provider: drops client connections and deregisters from the
    /// master before returning.
    pub async fn close(self) {
        let (done, ack) = oneshot::channel();
        if self.sender.send(ProviderMsg::Close { done }).await.is_ok() {
            let _ = ack.await;
        }
    }
}

impl Drop for ServiceProvider {
    fn drop(&mut self) {
        let (done, _) = oneshot::channel();
        let _ = self.sender.try_send(ProviderMsg::Close { done });
    }
}

/// Per-service actor owned jointly by the user handle and the node registry.
pub(crate) struct Provider {
    pub(crate) abs_service: String,
    pub(crate) service_type: String,
    pub(crate) md5sum: String,
    pub(crate) request_type: String,
    pub(crate) response_type: String,
    pub(crate) caller_id: String,
    pub(crate) handler: ServiceHandler,
    pub(crate) master: Arc<MasterClient>,
    pub(crate) tcpros_uri: String,
    pub(crate) node_tx: mpsc::Sender<NodeMsg>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) conn_tasks: Vec<ChildTask<()>>,
}

impl Provider {
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::Receiver<ProviderMsg>,
        _alive: oneshot::Sender<()>,
    ) {
        debug!("Service provider loop started for {}", self.abs_service);
        let mut shutdown = self.shutdown.clone();
        let mut close_ack = None;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = rx.recv() => match msg {
                    None => break,
                    Some(ProviderMsg::Close { done }) => {
                        close_ack = Some(done);
                        break;
                    }
                    Some(ProviderMsg::ClientNew { stream, header }) => {
                        self.accept_client(stream, header).await;
                    }
                },
            }
        }

        rx.close();
        // Dropping the tasks closes every client connection mid-call
        self.conn_tasks.clear();
        if let Err(e) = self
            .master
            .unregister_service(&self.abs_service, &self.tcpros_uri)
            .await
        {
            debug!(
                "Failed to unregister service provider for {}: {e}",
                self.abs_service
            );
        }
        let _ = self
            .node_tx
            .send(NodeMsg::ServiceProviderClosed {
                abs_service: self.abs_service.clone(),
            })
            .await;
        if let Some(done) = close_ack {
            let _ = done.send(());
        }
        debug!("Service provider loop exited for {}", self.abs_service);
    }

    async fn accept_client(&mut self, mut stream: TcpStream, header: ConnectionHeader) {
        if let Err(reason) = header.validate_against(&self.md5sum, &self.service_type) {
            warn!(
                "Rejecting service client {} on {}: {reason}",
                header.caller_id, self.abs_service
            );
            let _ =
                tcpros::write_header(&mut stream, &ConnectionHeader::error_header(reason)).await;
            let _ = stream.shutdown().await;
            return;
        }

        let response = ConnectionHeader {
            caller_id: self.caller_id.clone(),
            topic_type: self.service_type.clone(),
            md5sum: Some(self.md5sum.clone()),
            request_type: Some(self.request_type.clone()),
            response_type: Some(self.response_type.clone()),
            ..Default::default()
        };
        if let Err(e) = tcpros::write_header(&mut stream, &response).await {
            debug!(
                "Failed to answer service client handshake on {}: {e}",
                self.abs_service
            );
            return;
        }

        info!(
            "Service {} got a new client: {}",
            self.abs_service, header.caller_id
        );
        let handler = self.handler.clone();
        let shutdown = self.shutdown.clone();
        let service = self.abs_service.clone();
        let task = tokio::spawn(serve_client(stream, handler, shutdown, service));
        self.conn_tasks.push(task.into());
    }
}

/// Serves one client connection: each request body is answered with the status
/// byte and either the response body or an error string, until the client
/// disconnects or the provider goes away.
async fn serve_client(
    mut stream: TcpStream,
    handler: ServiceHandler,
    mut shutdown: watch::Receiver<bool>,
    service: String,
) {
    loop {
        let request = tokio::select! {
            _ = shutdown.changed() => break,
            request = tcpros::read_body(&mut stream) => request,
        };
        let request = match request {
            Ok(request) => request,
            Err(Error::TransportClosed) => break,
            Err(e) => {
                debug!("Dropping service client on {service}: {e}");
                break;
            }
        };
        let outcome = handler(request);
        let write_result = match outcome {
            Ok(response) => {
                // The response from the codec already carries its length prefix
                match stream.write_all(&[SERVICE_OK]).await {
                    Ok(()) => stream.write_all(&response).await,
                    Err(e) => Err(e),
                }
            }
            Err(message) => match stream.write_all(&[SERVICE_ERROR]).await {
                Ok(()) => tcpros::write_frame(&mut stream, message.as_bytes())
                    .await
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string())),
                Err(e) => Err(e),
            },
        };
        if let Err(e) = write_result {
            debug!("Failed to answer service client on {service}: {e}");
            break;
        }
    }
    let _ = stream.shutdown().await;
}
