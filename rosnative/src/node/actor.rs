//! The node server loop: single owner of the registry maps and router for
//! every cross-entity handshake.
//!
//! All registry mutations flow through one task draining one channel, which
//! gives a total order over registrations, closures and inbound handshakes
//! without locks. The loop talks to entity loops over their own channels and
//! treats a closed entity channel as "entity is terminating": the delivery is
//! silently dropped (an orphan connection is closed, an inbound slave call is
//! answered with an error).

use crate::master_client::MasterClient;
use crate::publisher::PublicationMsg;
use crate::service_server::ProviderMsg;
use crate::subscriber::SubscriptionMsg;
use crate::tcpros::{self, ConnectionHeader};
use crate::udpros::FrameHeader;
use log::*;
use rosnative_common::{Error, Result};
use serde_xmlrpc::Value;
use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// How long the shutdown sequence waits for any single entity to finish its
/// own cleanup (master deregistration included) before giving up on it.
const ENTITY_SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);

static NEXT_LINK_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-unique token identifying one subscriber-side UDP relation.
pub(crate) fn next_link_token() -> u64 {
    NEXT_LINK_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// One row of a getBusInfo response.
pub(crate) struct BusInfoEntry {
    pub connection_id: i32,
    pub destination_id: String,
    pub direction: &'static str,
    pub transport: &'static str,
    pub topic: String,
    pub connected: bool,
    pub info: String,
}

impl BusInfoEntry {
    pub(crate) fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::Int(self.connection_id),
            self.destination_id.as_str().into(),
            self.direction.into(),
            self.transport.into(),
            self.topic.as_str().into(),
            Value::Bool(self.connected),
            self.info.as_str().into(),
        ])
    }
}

/// A subscriber-side UDP relation: incoming datagrams whose connection id and
/// source address match are forwarded to the owning subscriber-publisher task.
pub(crate) struct UdpLink {
    pub token: u64,
    pub connection_id: u32,
    pub remote_ip: IpAddr,
    pub sender: mpsc::Sender<(FrameHeader, Vec<u8>)>,
}

pub(crate) enum NodeMsg {
    GetPublications {
        reply: oneshot::Sender<Vec<(String, String)>>,
    },
    GetSubscriptions {
        reply: oneshot::Sender<Vec<(String, String)>>,
    },
    GetBusInfo {
        reply: oneshot::Sender<Vec<BusInfoEntry>>,
    },
    TcpConnNew {
        stream: TcpStream,
    },
    TcpConnClosed {
        token: u64,
    },
    TcpConnSubscriber {
        token: u64,
        stream: TcpStream,
        header: ConnectionHeader,
    },
    TcpConnServiceClient {
        token: u64,
        stream: TcpStream,
        header: ConnectionHeader,
    },
    UdpLinkNew {
        link: UdpLink,
    },
    UdpLinkClosed {
        token: u64,
        done: oneshot::Sender<()>,
    },
    UdpFrame {
        header: FrameHeader,
        payload: Vec<u8>,
        source: SocketAddr,
    },
    RequestTopic {
        topic: String,
        protocols: Vec<Value>,
        reply: oneshot::Sender<Result<Vec<Value>>>,
    },
    PublisherUpdate {
        topic: String,
        publishers: Vec<String>,
    },
    PublisherNew {
        topic: String,
        abs_topic: String,
        topic_type: String,
        sender: mpsc::Sender<PublicationMsg>,
        alive: oneshot::Receiver<()>,
        reply: oneshot::Sender<Result<usize>>,
    },
    PublisherClosed {
        abs_topic: String,
    },
    SubscriberNew {
        topic: String,
        abs_topic: String,
        topic_type: String,
        sender: mpsc::Sender<SubscriptionMsg>,
        alive: oneshot::Receiver<()>,
        reply: oneshot::Sender<Result<()>>,
    },
    SubscriberClosed {
        abs_topic: String,
    },
    ServiceProviderNew {
        abs_service: String,
        sender: mpsc::Sender<ProviderMsg>,
        alive: oneshot::Receiver<()>,
        reply: oneshot::Sender<Result<()>>,
    },
    ServiceProviderClosed {
        abs_service: String,
    },
}

struct PublisherEntry {
    topic: String,
    topic_type: String,
    sender: mpsc::Sender<PublicationMsg>,
    alive: oneshot::Receiver<()>,
}

struct SubscriberEntry {
    topic: String,
    topic_type: String,
    sender: mpsc::Sender<SubscriptionMsg>,
    alive: oneshot::Receiver<()>,
}

struct ProviderEntry {
    sender: mpsc::Sender<ProviderMsg>,
    alive: oneshot::Receiver<()>,
}

pub(crate) struct NodeServer {
    rx: mpsc::Receiver<NodeMsg>,
    node_tx: mpsc::Sender<NodeMsg>,
    shutdown: watch::Receiver<bool>,
    master: Arc<MasterClient>,
    slave_uri: String,
    tcpros_uri: String,
    // Keyed by absolute name; BTreeMap so snapshots iterate deterministically
    publishers: BTreeMap<String, PublisherEntry>,
    subscribers: BTreeMap<String, SubscriberEntry>,
    providers: BTreeMap<String, ProviderEntry>,
    udp_links: Vec<UdpLink>,
    // Accepted TCPROS connections that have not yet declared a role
    conn_tasks: HashMap<u64, JoinHandle<()>>,
    next_conn_token: u64,
    publisher_last_id: usize,
    // Accept loops and the slave API server, joined during shutdown
    server_tasks: Vec<JoinHandle<()>>,
}

impl NodeServer {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        rx: mpsc::Receiver<NodeMsg>,
        node_tx: mpsc::Sender<NodeMsg>,
        shutdown: watch::Receiver<bool>,
        master: Arc<MasterClient>,
        slave_uri: String,
        tcpros_uri: String,
        server_tasks: Vec<JoinHandle<()>>,
    ) -> Self {
        NodeServer {
            rx,
            node_tx,
            shutdown,
            master,
            slave_uri,
            tcpros_uri,
            publishers: BTreeMap::new(),
            subscribers: BTreeMap::new(),
            providers: BTreeMap::new(),
            udp_links: Vec::new(),
            conn_tasks: HashMap::new(),
            next_conn_token: 1,
            publisher_last_id: 0,
            server_tasks,
        }
    }

    pub(crate) async fn run(mut self) {
        debug!("Node server loop started");
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
            }
        }
        self.shutdown_sequence().await;
    }

    async fn handle(&mut self, msg: NodeMsg) {
        match msg {
            NodeMsg::GetPublications { reply } => {
                let snapshot = self
                    .publishers
                    .values()
                    .map(|p| (p.topic.clone(), p.topic_type.clone()))
                    .collect();
                let _ = reply.send(snapshot);
            }
            NodeMsg::GetSubscriptions { reply } => {
                let snapshot = self
                    .subscribers
                    .values()
                    .map(|s| (s.topic.clone(), s.topic_type.clone()))
                    .collect();
                let _ = reply.send(snapshot);
            }
            NodeMsg::GetBusInfo { reply } => {
                let mut entries = Vec::new();
                for entry in self.publishers.values() {
                    let (tx, rx) = oneshot::channel();
                    if entry
                        .sender
                        .send(PublicationMsg::GetBusInfo { reply: tx })
                        .await
                        .is_ok()
                    {
                        if let Ok(mut list) = rx.await {
                            entries.append(&mut list);
                        }
                    }
                }
                for entry in self.subscribers.values() {
                    let (tx, rx) = oneshot::channel();
                    if entry
                        .sender
                        .send(SubscriptionMsg::GetBusInfo { reply: tx })
                        .await
                        .is_ok()
                    {
                        if let Ok(mut list) = rx.await {
                            entries.append(&mut list);
                        }
                    }
                }
                let _ = reply.send(entries);
            }
            NodeMsg::TcpConnNew { stream } => {
                let token = self.next_conn_token;
                self.next_conn_token += 1;
                let node_tx = self.node_tx.clone();
                let shutdown = self.shutdown.clone();
                let task =
                    tokio::spawn(
                        async move { classify_connection(token, stream, node_tx, shutdown).await },
                    );
                self.conn_tasks.insert(token, task);
            }
            NodeMsg::TcpConnClosed { token } => {
                self.conn_tasks.remove(&token);
            }
            NodeMsg::TcpConnSubscriber {
                token,
                stream,
                header,
            } => {
                // Role declared, the connection is no longer an orphan
                self.conn_tasks.remove(&token);
                let topic = header.topic.clone().unwrap_or_default();
                match self.publishers.get(&topic) {
                    Some(entry) => {
                        // A closed channel means the publisher is terminating;
                        // dropping the stream closes the connection
                        let _ = entry
                            .sender
                            .send(PublicationMsg::SubscriberTcpNew { stream, header })
                            .await;
                    }
                    None => {
                        debug!("Closing subscriber connection for unknown topic {topic}");
                    }
                }
            }
            NodeMsg::TcpConnServiceClient {
                token,
                stream,
                header,
            } => {
                self.conn_tasks.remove(&token);
                let service = header.service.clone().unwrap_or_default();
                match self.providers.get(&service) {
                    Some(entry) => {
                        let _ = entry
                            .sender
                            .send(ProviderMsg::ClientNew { stream, header })
                            .await;
                    }
                    None => {
                        debug!("Closing service client connection for unknown service {service}");
                    }
                }
            }
            NodeMsg::UdpLinkNew { link } => {
                self.udp_links.push(link);
            }
            NodeMsg::UdpLinkClosed { token, done } => {
                self.udp_links.retain(|link| link.token != token);
                let _ = done.send(());
            }
            NodeMsg::UdpFrame {
                header,
                payload,
                source,
            } => {
                match self.udp_links.iter().find(|link| {
                    link.connection_id == header.connection_id && link.remote_ip == source.ip()
                }) {
                    // A full queue drops the frame, which UDP permits
                    Some(link) => {
                        let _ = link.sender.try_send((header, payload));
                    }
                    None => {
                        trace!(
                            "Dropping datagram from {source} with unknown connection id {}",
                            header.connection_id
                        );
                    }
                }
            }
            NodeMsg::RequestTopic {
                topic,
                protocols,
                reply,
            } => match self.publishers.get(&topic) {
                Some(entry) => {
                    if let Err(mpsc::error::SendError(PublicationMsg::RequestTopic {
                        reply, ..
                    })) = entry
                        .sender
                        .send(PublicationMsg::RequestTopic { protocols, reply })
                        .await
                    {
                        let _ =
                            reply.send(Err(Error::Unexpected(anyhow::anyhow!("terminating"))));
                    }
                }
                None => {
                    let _ = reply.send(Err(Error::Unexpected(anyhow::anyhow!("topic not found"))));
                }
            },
            NodeMsg::PublisherUpdate { topic, publishers } => {
                match self.subscribers.get(&topic) {
                    Some(entry) => {
                        let _ = entry
                            .sender
                            .send(SubscriptionMsg::PublisherUpdate(publishers))
                            .await;
                    }
                    None => {
                        // A racing update after subscriberClose is dropped on purpose
                        debug!("Dropping publisher update for unknown topic {topic}");
                    }
                }
            }
            NodeMsg::PublisherNew {
                topic,
                abs_topic,
                topic_type,
                sender,
                alive,
                reply,
            } => {
                if self.publishers.contains_key(&abs_topic) {
                    let _ = reply.send(Err(Error::NameConflict(format!(
                        "topic {abs_topic} already published"
                    ))));
                    return;
                }
                match self
                    .master
                    .register_publisher(&abs_topic, &topic_type, &self.slave_uri)
                    .await
                {
                    Ok(_) => {
                        self.publisher_last_id += 1;
                        let id = self.publisher_last_id;
                        self.publishers.insert(
                            abs_topic,
                            PublisherEntry {
                                topic,
                                topic_type,
                                sender,
                                alive,
                            },
                        );
                        let _ = reply.send(Ok(id));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            NodeMsg::PublisherClosed { abs_topic } => {
                self.publishers.remove(&abs_topic);
            }
            NodeMsg::SubscriberNew {
                topic,
                abs_topic,
                topic_type,
                sender,
                alive,
                reply,
            } => {
                if self.subscribers.contains_key(&abs_topic) {
                    let _ = reply.send(Err(Error::NameConflict(format!(
                        "topic {abs_topic} already subscribed"
                    ))));
                    return;
                }
                match self
                    .master
                    .register_subscriber(&abs_topic, &topic_type, &self.slave_uri)
                    .await
                {
                    Ok(uris) => {
                        self.subscribers.insert(
                            abs_topic,
                            SubscriberEntry {
                                topic,
                                topic_type,
                                sender: sender.clone(),
                                alive,
                            },
                        );
                        let _ = reply.send(Ok(()));
                        // Seed the subscriber with the publishers known right now
                        let _ = sender.send(SubscriptionMsg::PublisherUpdate(uris)).await;
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            NodeMsg::SubscriberClosed { abs_topic } => {
                self.subscribers.remove(&abs_topic);
            }
            NodeMsg::ServiceProviderNew {
                abs_service,
                sender,
                alive,
                reply,
            } => {
                if self.providers.contains_key(&abs_service) {
                    let _ = reply.send(Err(Error::NameConflict(format!(
                        "service {abs_service} already provided"
                    ))));
                    return;
                }
                match self
                    .master
                    .register_service(&abs_service, &self.tcpros_uri, &self.slave_uri)
                    .await
                {
                    Ok(_) => {
                        self.providers
                            .insert(abs_service, ProviderEntry { sender, alive });
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            NodeMsg::ServiceProviderClosed { abs_service } => {
                self.providers.remove(&abs_service);
            }
        }
    }

    async fn shutdown_sequence(mut self) {
        debug!("Node server loop shutting down");
        // Stop accepting new requests; queued requests drop, which surfaces as
        // a cancellation to their callers
        self.rx.close();

        // The accept loops and the slave server observe the shutdown signal
        for task in self.server_tasks.drain(..) {
            let _ = task.await;
        }
        // Connections that never declared a role observe it as well
        for (_, task) in self.conn_tasks.drain() {
            let _ = task.await;
        }
        self.udp_links.clear();

        // Every owned entity runs its own cleanup (master deregistration
        // included); wait for each so a node close means everything closed.
        // Subscribers go first so the sim-clock feed stops early, the rosout
        // publisher goes down with the rest of the publishers at the end.
        for (_, entry) in std::mem::take(&mut self.subscribers) {
            let _ = tokio::time::timeout(ENTITY_SHUTDOWN_TIMEOUT, entry.alive).await;
        }
        for (_, entry) in std::mem::take(&mut self.providers) {
            let _ = tokio::time::timeout(ENTITY_SHUTDOWN_TIMEOUT, entry.alive).await;
        }
        for (_, entry) in std::mem::take(&mut self.publishers) {
            let _ = tokio::time::timeout(ENTITY_SHUTDOWN_TIMEOUT, entry.alive).await;
        }
        debug!("Node server loop has shut down");
    }
}

/// Owns a freshly accepted TCPROS connection until its first header block
/// declares it a topic subscriber or a service client, then hands the socket
/// back to the loop for routing. Undeclared connections die with the node.
async fn classify_connection(
    token: u64,
    mut stream: TcpStream,
    node_tx: mpsc::Sender<NodeMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    if *shutdown.borrow() {
        return;
    }
    let header = tokio::select! {
        _ = shutdown.changed() => None,
        header = tcpros::read_header(&mut stream) => Some(header),
    };
    let msg = match header {
        // Node is closing; dropping the stream closes the connection
        None => None,
        Some(Ok(header)) if header.service.is_some() => Some(NodeMsg::TcpConnServiceClient {
            token,
            stream,
            header,
        }),
        Some(Ok(header)) if header.topic.is_some() => Some(NodeMsg::TcpConnSubscriber {
            token,
            stream,
            header,
        }),
        Some(Ok(_)) => {
            warn!("Inbound connection declared neither a topic nor a service, closing");
            Some(NodeMsg::TcpConnClosed { token })
        }
        Some(Err(e)) => {
            debug!("Inbound connection closed before declaring a role: {e}");
            Some(NodeMsg::TcpConnClosed { token })
        }
    };
    if let Some(msg) = msg {
        let _ = node_tx.send(msg).await;
    }
}
