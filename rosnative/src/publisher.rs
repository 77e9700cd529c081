//! Topic publishing: the typed `Publisher` handle users hold, and the
//! per-topic `Publication` actor that tracks subscriber connections, answers
//! `requestTopic` negotiation and fans messages out.

use crate::master_client::MasterClient;
use crate::node::actor::{BusInfoEntry, NodeMsg};
use crate::tcpros::{self, ConnectionHeader};
use crate::udpros;
use abort_on_drop::ChildTask;
use anyhow::anyhow;
use log::*;
use rosnative_common::{Error, Result, RosMessageType};
use serde_xmlrpc::Value;
use std::{marker::PhantomData, net::SocketAddr, sync::Arc};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpStream, UdpSocket},
    sync::{mpsc, oneshot, watch},
};

/// Capacity of a publication's inbox; also buffers handshakes that arrive
/// while the publication is still registering.
pub(crate) const PUBLICATION_INBOX: usize = 64;

pub(crate) enum PublicationMsg {
    /// An inbound connection that declared itself a subscriber for this topic.
    SubscriberTcpNew {
        stream: TcpStream,
        header: ConnectionHeader,
    },
    /// An inbound slave API requestTopic call; the reply carries the
    /// negotiated `[protocol, params...]` tuple.
    RequestTopic {
        protocols: Vec<Value>,
        reply: oneshot::Sender<Result<Vec<Value>>>,
    },
    /// An encoded message body (length prefix included) to fan out.
    Publish { body: Vec<u8> },
    GetBusInfo {
        reply: oneshot::Sender<Vec<BusInfoEntry>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// The typed publisher handle returned by advertising a topic.
///
/// Dropping the handle tears the publication down; `close` does the same but
/// returns only after deregistration finished.
pub struct Publisher<T> {
    topic: String,
    sender: mpsc::Sender<PublicationMsg>,
    phantom: PhantomData<T>,
}

impl<T: RosMessageType> Publisher<T> {
    pub(crate) fn new(topic: &str, sender: mpsc::Sender<PublicationMsg>) -> Self {
        Publisher {
            topic: topic.to_owned(),
            sender,
            phantom: PhantomData,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Encodes the message once and queues it for every connected subscriber.
    ///
    /// Slow subscribers never block this call: a connection whose outbound
    /// queue is full is dropped instead, and is expected to reconnect.
    pub async fn publish(&self, msg: &T) -> Result<()> {
        let body = serde_rosmsg::to_vec(msg)
            .map_err(|e| Error::Serialization(format!("failed to encode message: {e}")))?;
        self.sender
            .send(PublicationMsg::Publish { body })
            .await
            .map_err(|_| Error::Cancelled)?;
        debug!("Publishing data on topic {}", self.topic);
        Ok(())
    }

    /// Closes the publication: disconnects subscribers and deregisters from
    /// the master before returning.
    pub async fn close(self) {
        let (done, ack) = oneshot::channel();
        if self.sender.send(PublicationMsg::Close { done }).await.is_ok() {
            let _ = ack.await;
        }
    }
}

impl<T> Drop for Publisher<T> {
    fn drop(&mut self) {
        let (done, _) = oneshot::channel();
        let _ = self.sender.try_send(PublicationMsg::Close { done });
    }
}

pub(crate) struct TcpSubscriber {
    connection_id: u32,
    caller_id: String,
    queue: mpsc::Sender<Vec<u8>>,
    _task: ChildTask<()>,
}

pub(crate) struct UdpPeer {
    connection_id: u32,
    caller_id: String,
    addr: SocketAddr,
}

/// Per-topic actor owned jointly by the user handle and the node registry.
pub(crate) struct Publication {
    pub(crate) abs_topic: String,
    pub(crate) topic_type: String,
    pub(crate) md5sum: String,
    pub(crate) definition: String,
    pub(crate) latching: bool,
    pub(crate) caller_id: String,
    pub(crate) host: String,
    pub(crate) tcpros_port: u16,
    pub(crate) udpros_port: u16,
    pub(crate) udp_socket: Arc<UdpSocket>,
    pub(crate) udp_max_payload: usize,
    pub(crate) out_queue_size: usize,
    pub(crate) master: Arc<MasterClient>,
    pub(crate) slave_uri: String,
    pub(crate) node_tx: mpsc::Sender<NodeMsg>,
    pub(crate) shutdown: watch::Receiver<bool>,

    pub(crate) subscribers: Vec<TcpSubscriber>,
    pub(crate) udp_peers: Vec<UdpPeer>,
    pub(crate) latched: Option<Vec<u8>>,
    pub(crate) next_conn_id: u32,
    pub(crate) next_msg_id: u8,
}

impl Publication {
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::Receiver<PublicationMsg>,
        _alive: oneshot::Sender<()>,
    ) {
        debug!("Publication loop started for {}", self.abs_topic);
        let mut shutdown = self.shutdown.clone();
        let mut close_ack = None;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = rx.recv() => match msg {
                    None => break,
                    Some(PublicationMsg::Close { done }) => {
                        close_ack = Some(done);
                        break;
                    }
                    Some(msg) => self.handle(msg).await,
                },
            }
        }

        // Refuse new work first so the node loop never blocks on us mid-cleanup
        rx.close();
        self.subscribers.clear();
        self.udp_peers.clear();
        if let Err(e) = self
            .master
            .unregister_publisher(&self.abs_topic, &self.slave_uri)
            .await
        {
            debug!("Failed to unregister publisher for {}: {e}", self.abs_topic);
        }
        let _ = self
            .node_tx
            .send(NodeMsg::PublisherClosed {
                abs_topic: self.abs_topic.clone(),
            })
            .await;
        if let Some(done) = close_ack {
            let _ = done.send(());
        }
        debug!("Publication loop exited for {}", self.abs_topic);
    }

    async fn handle(&mut self, msg: PublicationMsg) {
        match msg {
            PublicationMsg::SubscriberTcpNew { stream, header } => {
                self.accept_subscriber(stream, header).await;
            }
            PublicationMsg::RequestTopic { protocols, reply } => {
                let _ = reply.send(self.negotiate(protocols).await);
            }
            PublicationMsg::Publish { body } => {
                self.fan_out(body).await;
            }
            PublicationMsg::GetBusInfo { reply } => {
                let _ = reply.send(self.bus_info());
            }
            // Handled by the run loop
            PublicationMsg::Close { .. } => unreachable!(),
        }
    }

    async fn accept_subscriber(&mut self, mut stream: TcpStream, header: ConnectionHeader) {
        if let Err(reason) = header.validate_against(&self.md5sum, &self.topic_type) {
            warn!(
                "Rejecting subscriber {} on {}: {reason}",
                header.caller_id, self.abs_topic
            );
            let _ = tcpros::write_header(&mut stream, &ConnectionHeader::error_header(reason)).await;
            let _ = stream.shutdown().await;
            return;
        }
        if header.tcp_nodelay == Some(true) {
            let _ = stream.set_nodelay(true);
        }

        let response = ConnectionHeader {
            caller_id: self.caller_id.clone(),
            topic: Some(self.abs_topic.clone()),
            topic_type: self.topic_type.clone(),
            md5sum: Some(self.md5sum.clone()),
            msg_definition: self.definition.clone(),
            latching: Some(self.latching),
            ..Default::default()
        };
        if let Err(e) = tcpros::write_header(&mut stream, &response).await {
            debug!("Failed to answer subscriber handshake on {}: {e}", self.abs_topic);
            return;
        }

        let (queue, queue_rx) = mpsc::channel(self.out_queue_size);
        // A latched topic replays the last message to every new subscriber
        if self.latching {
            if let Some(latched) = &self.latched {
                let _ = queue.try_send(latched.clone());
            }
        }
        let task = tokio::spawn(subscriber_writer(stream, queue_rx, self.shutdown.clone()));
        self.next_conn_id += 1;
        info!(
            "Topic {} got a new tcp subscriber: {}",
            self.abs_topic, header.caller_id
        );
        self.subscribers.push(TcpSubscriber {
            connection_id: self.next_conn_id,
            caller_id: header.caller_id,
            queue,
            _task: task.into(),
        });
    }

    /// Picks the first requested protocol we support and returns its
    /// connection parameters.
    async fn negotiate(&mut self, protocols: Vec<Value>) -> Result<Vec<Value>> {
        for protocol in &protocols {
            let Value::Array(params) = protocol else {
                continue;
            };
            let Some(Value::String(name)) = params.first() else {
                continue;
            };
            match name.as_str() {
                "TCPROS" => {
                    return Ok(vec![
                        "TCPROS".into(),
                        self.host.as_str().into(),
                        Value::Int(self.tcpros_port as i32),
                    ]);
                }
                "UDPROS" => {
                    let connection_id = self.register_udp_peer(params).await?;
                    return Ok(vec![
                        "UDPROS".into(),
                        self.host.as_str().into(),
                        Value::Int(self.udpros_port as i32),
                        Value::Int(connection_id as i32),
                        self.md5sum.as_str().into(),
                        self.topic_type.as_str().into(),
                        self.definition.as_str().into(),
                    ]);
                }
                other => {
                    debug!("Protocol {other} requested for {} not supported", self.abs_topic);
                }
            }
        }
        Err(Error::Unexpected(anyhow!(
            "none of the requested protocols are supported"
        )))
    }

    /// Validates the prospective UDP subscriber's header and records the peer
    /// under a freshly allocated connection id.
    async fn register_udp_peer(&mut self, params: &[Value]) -> Result<u32> {
        let Some(Value::Base64(header_bytes)) = params.get(1) else {
            return Err(Error::Malformed(
                "UDPROS request without a connection header".to_owned(),
            ));
        };
        if header_bytes.len() < 4 {
            return Err(Error::Malformed("UDPROS connection header too short".to_owned()));
        }
        let remote = ConnectionHeader::from_bytes(&header_bytes[4..])?;
        remote
            .validate_against(&self.md5sum, &self.topic_type)
            .map_err(Error::HandshakeMismatch)?;

        let (Some(Value::String(host)), Some(Value::Int(port))) = (params.get(2), params.get(3))
        else {
            return Err(Error::Malformed(
                "UDPROS request without a destination address".to_owned(),
            ));
        };
        let port = u16::try_from(*port)
            .map_err(|_| Error::Malformed(format!("invalid UDPROS port {port}")))?;
        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(Error::IoError)?
            .next()
            .ok_or_else(|| Error::Malformed(format!("unable to resolve {host}")))?;

        self.next_conn_id += 1;
        info!(
            "Topic {} got a new udp subscriber: {} at {addr}",
            self.abs_topic, remote.caller_id
        );
        self.udp_peers.push(UdpPeer {
            connection_id: self.next_conn_id,
            caller_id: remote.caller_id,
            addr,
        });
        Ok(self.next_conn_id)
    }

    async fn fan_out(&mut self, body: Vec<u8>) {
        if self.latching {
            self.latched = Some(body.clone());
        }

        let abs_topic = &self.abs_topic;
        self.subscribers.retain(|sub| match sub.queue.try_send(body.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Subscriber {} on {abs_topic} can't keep up, dropping the connection",
                    sub.caller_id
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Subscriber {} on {abs_topic} went away", sub.caller_id);
                false
            }
        });

        if !self.udp_peers.is_empty() {
            // The datagram header frames the payload, drop the length prefix
            let payload = body.get(4..).unwrap_or_default();
            self.next_msg_id = self.next_msg_id.wrapping_add(1);
            for peer in &self.udp_peers {
                for datagram in udpros::split_message(
                    peer.connection_id,
                    self.next_msg_id,
                    payload,
                    self.udp_max_payload,
                ) {
                    if let Err(e) = self.udp_socket.send_to(&datagram, peer.addr).await {
                        debug!("Failed to send datagram to {}: {e}", peer.addr);
                        break;
                    }
                }
            }
        }
    }

    fn bus_info(&self) -> Vec<BusInfoEntry> {
        let mut entries = Vec::new();
        for sub in &self.subscribers {
            entries.push(BusInfoEntry {
                connection_id: sub.connection_id as i32,
                destination_id: sub.caller_id.clone(),
                direction: "o",
                transport: "TCPROS",
                topic: self.abs_topic.clone(),
                connected: true,
                info: String::new(),
            });
        }
        for peer in &self.udp_peers {
            entries.push(BusInfoEntry {
                connection_id: peer.connection_id as i32,
                destination_id: peer.caller_id.clone(),
                direction: "o",
                transport: "UDPROS",
                topic: self.abs_topic.clone(),
                connected: true,
                info: String::new(),
            });
        }
        entries
    }
}

/// Owns one subscriber connection after the handshake; writes queued bodies
/// until the queue closes, the peer goes away, or the node shuts down.
async fn subscriber_writer(
    mut stream: TcpStream,
    mut queue: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            body = queue.recv() => match body {
                None => break,
                Some(body) => {
                    if let Err(e) = stream.write_all(&body).await {
                        debug!("Failed to write to subscriber: {e}");
                        break;
                    }
                }
            },
        }
    }
    let _ = stream.shutdown().await;
}
