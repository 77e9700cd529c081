//! The node: configuration, construction of the three servers, and the public
//! handle through which publishers, subscribers and services are created.

pub(crate) mod actor;
mod xmlrpc;

use crate::master_client::{MasterClient, API_CALL_TIMEOUT};
use crate::names;
use crate::param_client::ParamClient;
use crate::publisher::{self, Publication, Publisher};
use crate::service_client::ServiceClient;
use crate::service_server::{self, Provider, ServiceHandler, ServiceProvider};
use crate::simtime::SimClock;
use crate::subscriber::{self, Protocol, Subscriber, Subscription};
use crate::udpros::{self, FrameHeader};
use actor::{NodeMsg, NodeServer};
use log::*;
use rosnative_common::{Duration, Error, Result, RosMessageType, RosServiceType, ServiceFn, Time};
use rosnative_msgs::{rosgraph_msgs, std_msgs};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, oneshot, watch};

const DEFAULT_MASTER_ADDRESS: &str = "127.0.0.1:11311";
const DEFAULT_OUT_QUEUE_SIZE: usize = 1024;
const NODE_INBOX: usize = 128;

/// Configuration of a [Node]. Only `name` is required.
#[derive(Clone, Debug)]
pub struct NodeConf {
    /// Name of this node, without slashes.
    pub name: String,
    /// Namespace of this node, absolute. Defaults to `/` and is overridden by
    /// the `ROS_NAMESPACE` environment variable when that is non-empty.
    pub namespace: String,
    /// Hostname (or ip) and port of the master. An `http://` prefix is
    /// accepted and stripped.
    pub master_address: String,
    /// Hostname or ip other nodes use to reach this one. Auto-selected from
    /// the local interfaces when empty.
    pub host: String,
    /// Port of the slave API server; 0 picks an ephemeral port.
    pub apislave_port: u16,
    /// Port of the TCPROS server; 0 picks an ephemeral port.
    pub tcpros_port: u16,
    /// Port of the UDPROS server; 0 picks an ephemeral port.
    pub udpros_port: u16,
    /// Per-subscriber outbound queue capacity; a subscriber that falls this
    /// far behind is disconnected rather than slowing the publisher.
    pub out_queue_size: usize,
    /// Largest UDPROS datagram payload before fragmentation kicks in.
    pub udp_max_payload: usize,
}

impl NodeConf {
    pub fn new(name: &str) -> Self {
        NodeConf {
            name: name.to_owned(),
            namespace: "/".to_owned(),
            master_address: DEFAULT_MASTER_ADDRESS.to_owned(),
            host: String::new(),
            apislave_port: 0,
            tcpros_port: 0,
            udpros_port: 0,
            out_queue_size: DEFAULT_OUT_QUEUE_SIZE,
            udp_max_payload: udpros::DEFAULT_MAX_PAYLOAD,
        }
    }
}

struct NodeInner {
    conf: NodeConf,
    node_name: String,
    node_tx: mpsc::Sender<NodeMsg>,
    master: Arc<MasterClient>,
    params: ParamClient,
    sim: Arc<SimClock>,
    http: reqwest::Client,
    cancel: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
    done: watch::Receiver<bool>,
    slave_uri: String,
    tcpros_uri: String,
    tcpros_port: u16,
    udpros_port: u16,
    udp_socket: Arc<UdpSocket>,
    rosout: OnceLock<Publisher<rosgraph_msgs::Log>>,
    clock_subscriber: OnceLock<Subscriber>,
}

impl Drop for NodeInner {
    fn drop(&mut self) {
        // Best effort: tasks observe the signal and clean up on their own
        let _ = self.cancel.send(true);
    }
}

/// A participant in the ROS graph: owns the three servers and the registry of
/// publishers, subscribers and service providers created through it.
///
/// Cloning the handle is cheap and shares the underlying node. The node
/// outlives its children: closing it closes every entity created from it.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Builds the node: resolves the configuration, binds the slave API,
    /// TCPROS and UDPROS servers, starts the coordinating loop, registers the
    /// `/rosout` publisher and, when `/use_sim_time` is set, the `/clock`
    /// subscriber.
    pub async fn new(conf: NodeConf) -> Result<Node> {
        let mut conf = conf;
        if let Ok(namespace) = std::env::var("ROS_NAMESPACE") {
            if !namespace.is_empty() {
                conf.namespace = namespace;
            }
        }
        if conf.namespace.is_empty() {
            conf.namespace = "/".to_owned();
        }
        names::validate_namespace(&conf.namespace)?;
        names::validate_node_name(&conf.name)?;

        if conf.master_address.is_empty() {
            conf.master_address = DEFAULT_MASTER_ADDRESS.to_owned();
        }
        let master_address = conf
            .master_address
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_owned();
        let master_addr = tokio::net::lookup_host(&master_address)
            .await
            .map_err(|e| {
                Error::ConfigInvalid(format!(
                    "unable to resolve master address {}: {e}",
                    conf.master_address
                ))
            })?
            .next()
            .ok_or_else(|| {
                Error::ConfigInvalid(format!(
                    "unable to resolve master address {}",
                    conf.master_address
                ))
            })?;
        if conf.host.is_empty() {
            conf.host = default_host(&master_addr)?;
        }
        let master_uri = format!("http://{master_address}/");
        let node_name = names::resolve(&conf.namespace, &conf.name);

        // Servers first, so the URIs we register are live before the master
        // ever hands them out
        let tcpros_listener = TcpListener::bind((conf.host.as_str(), conf.tcpros_port)).await?;
        let tcpros_port = tcpros_listener.local_addr()?.port();
        let udp_socket = Arc::new(UdpSocket::bind((conf.host.as_str(), conf.udpros_port)).await?);
        let udpros_port = udp_socket.local_addr()?.port();
        let slave_addr: SocketAddr =
            tokio::net::lookup_host((conf.host.as_str(), conf.apislave_port))
                .await?
                .next()
                .ok_or_else(|| {
                    Error::ConfigInvalid(format!("unable to resolve host {}", conf.host))
                })?;

        let (cancel, shutdown) = watch::channel(false);
        let cancel = Arc::new(cancel);
        let (done_tx, done) = watch::channel(false);
        let (node_tx, node_rx) = mpsc::channel(NODE_INBOX);

        let master = Arc::new(MasterClient::new(master_uri.clone(), node_name.clone())?);
        let params = ParamClient::new(master_uri.clone(), node_name.clone())?;
        let http = reqwest::Client::builder()
            .timeout(API_CALL_TIMEOUT)
            .build()
            .map_err(|e| Error::Unexpected(anyhow::anyhow!("failed to build http client: {e}")))?;

        let (apislave_port, slave_task) = xmlrpc::spawn(
            slave_addr,
            node_tx.clone(),
            master_uri.clone(),
            cancel.clone(),
            shutdown.clone(),
        )?;
        let slave_uri = format!("http://{}:{}/", conf.host, apislave_port);
        let tcpros_uri = format!("rosrpc://{}:{}", conf.host, tcpros_port);
        info!("Node {node_name} listening on {slave_uri}");

        let tcp_task = tokio::spawn(tcp_accept_loop(
            tcpros_listener,
            node_tx.clone(),
            shutdown.clone(),
        ));
        let udp_task = tokio::spawn(udp_recv_loop(
            udp_socket.clone(),
            node_tx.clone(),
            shutdown.clone(),
        ));

        let server = NodeServer::new(
            node_rx,
            node_tx.clone(),
            shutdown.clone(),
            master.clone(),
            slave_uri.clone(),
            tcpros_uri.clone(),
            vec![slave_task, tcp_task, udp_task],
        );
        tokio::spawn(async move {
            server.run().await;
            let _ = done_tx.send(true);
        });

        // The simulated clock is opted into through the parameter server
        let sim_enabled = {
            let has = match params.has("/use_sim_time").await {
                Ok(has) => has,
                Err(e) => {
                    let _ = cancel.send(true);
                    return Err(e);
                }
            };
            if has {
                match params.get::<bool>("/use_sim_time").await {
                    Ok(enabled) => enabled,
                    Err(e) => {
                        let _ = cancel.send(true);
                        return Err(e);
                    }
                }
            } else {
                false
            }
        };
        let sim = Arc::new(SimClock::new(sim_enabled));

        let node = Node {
            inner: Arc::new(NodeInner {
                conf,
                node_name,
                node_tx,
                master,
                params,
                sim,
                http,
                cancel,
                shutdown,
                done,
                slave_uri,
                tcpros_uri,
                tcpros_port,
                udpros_port,
                udp_socket,
                rosout: OnceLock::new(),
                clock_subscriber: OnceLock::new(),
            }),
        };

        // The node logs through /rosout like any other participant
        match node.advertise::<rosgraph_msgs::Log>("/rosout", false).await {
            Ok(publisher) => {
                let _ = node.inner.rosout.set(publisher);
            }
            Err(e) => {
                node.close().await;
                return Err(e);
            }
        }

        if sim_enabled {
            let sim = node.inner.sim.clone();
            let subscribed = node
                .subscribe::<rosgraph_msgs::Clock, _>("/clock", move |msg| {
                    sim.clock_update(msg.clock);
                })
                .await;
            match subscribed {
                Ok(subscriber) => {
                    let _ = node.inner.clock_subscriber.set(subscriber);
                }
                Err(e) => {
                    node.close().await;
                    return Err(e);
                }
            }
        }

        Ok(node)
    }

    /// The node's absolute name.
    pub fn name(&self) -> &str {
        &self.inner.node_name
    }

    /// The node's slave API URI, as registered with the master.
    pub fn uri(&self) -> &str {
        &self.inner.slave_uri
    }

    pub fn master_uri(&self) -> &str {
        self.inner.master.master_uri()
    }

    /// Creates a publisher on `topic`. At most one publisher per absolute
    /// topic name can exist on a node.
    pub async fn advertise<T: RosMessageType>(
        &self,
        topic: &str,
        latching: bool,
    ) -> Result<Publisher<T>> {
        names::validate_graph_name(topic)?;
        let abs_topic = names::resolve(&self.inner.conf.namespace, topic);

        let (tx, rx) = mpsc::channel(publisher::PUBLICATION_INBOX);
        let (alive_tx, alive_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .node_tx
            .send(NodeMsg::PublisherNew {
                topic: topic.to_owned(),
                abs_topic: abs_topic.clone(),
                topic_type: T::ROS_TYPE_NAME.to_owned(),
                sender: tx.clone(),
                alive: alive_rx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        let id = reply_rx.await.map_err(|_| Error::Cancelled)??;

        let publication = Publication {
            abs_topic,
            topic_type: T::ROS_TYPE_NAME.to_owned(),
            md5sum: T::MD5SUM.to_owned(),
            definition: T::DEFINITION.to_owned(),
            latching,
            caller_id: self.inner.node_name.clone(),
            host: self.inner.conf.host.clone(),
            tcpros_port: self.inner.tcpros_port,
            udpros_port: self.inner.udpros_port,
            udp_socket: self.inner.udp_socket.clone(),
            udp_max_payload: self.inner.conf.udp_max_payload,
            out_queue_size: self.inner.conf.out_queue_size,
            master: self.inner.master.clone(),
            slave_uri: self.inner.slave_uri.clone(),
            node_tx: self.inner.node_tx.clone(),
            shutdown: self.inner.shutdown.clone(),
            subscribers: Vec::new(),
            udp_peers: Vec::new(),
            latched: None,
            // Node-assigned publisher id partitions the connection id space
            next_conn_id: (id as u32) << 16,
            next_msg_id: 0,
        };
        tokio::spawn(publication.run(rx, alive_tx));
        Ok(Publisher::new(topic, tx))
    }

    /// Subscribes to `topic` over TCPROS, invoking `callback` for every
    /// decoded message. Messages from one publisher arrive in wire order; no
    /// ordering holds across publishers.
    pub async fn subscribe<T, F>(&self, topic: &str, callback: F) -> Result<Subscriber>
    where
        T: RosMessageType,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe_with(topic, Protocol::Tcp, callback).await
    }

    /// Subscribes with an explicit transport preference.
    pub async fn subscribe_with<T, F>(
        &self,
        topic: &str,
        protocol: Protocol,
        callback: F,
    ) -> Result<Subscriber>
    where
        T: RosMessageType,
        F: Fn(T) + Send + Sync + 'static,
    {
        names::validate_graph_name(topic)?;
        let abs_topic = names::resolve(&self.inner.conf.namespace, topic);

        let decode_topic = abs_topic.clone();
        let erased: Arc<dyn Fn(&[u8]) + Send + Sync> = Arc::new(move |body: &[u8]| {
            match serde_rosmsg::from_slice::<T>(body) {
                Ok(msg) => callback(msg),
                Err(e) => warn!("Failed to decode message on {decode_topic}: {e}"),
            }
        });

        let (tx, rx) = mpsc::channel(subscriber::SUBSCRIPTION_INBOX);
        let (alive_tx, alive_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .node_tx
            .send(NodeMsg::SubscriberNew {
                topic: topic.to_owned(),
                abs_topic: abs_topic.clone(),
                topic_type: T::ROS_TYPE_NAME.to_owned(),
                sender: tx.clone(),
                alive: alive_rx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        reply_rx.await.map_err(|_| Error::Cancelled)??;

        let subscription = Subscription {
            abs_topic,
            topic_type: T::ROS_TYPE_NAME.to_owned(),
            md5sum: T::MD5SUM.to_owned(),
            definition: T::DEFINITION.to_owned(),
            caller_id: self.inner.node_name.clone(),
            protocol,
            callback: erased,
            host: self.inner.conf.host.clone(),
            udpros_port: self.inner.udpros_port,
            udp_max_payload: self.inner.conf.udp_max_payload,
            master: self.inner.master.clone(),
            slave_uri: self.inner.slave_uri.clone(),
            node_tx: self.inner.node_tx.clone(),
            shutdown: self.inner.shutdown.clone(),
            http: self.inner.http.clone(),
            links: HashMap::new(),
            next_link_id: 0,
        };
        tokio::spawn(subscription.run(rx, alive_tx));
        Ok(Subscriber::new(topic, tx))
    }

    /// Advertises a service. The handler runs on the task serving the calling
    /// connection; returning an error sends the error string to the caller.
    pub async fn advertise_service<S, F>(&self, service: &str, handler: F) -> Result<ServiceProvider>
    where
        S: RosServiceType,
        F: ServiceFn<S>,
    {
        names::validate_graph_name(service)?;
        let abs_service = names::resolve(&self.inner.conf.namespace, service);

        let erased: ServiceHandler = Arc::new(move |body: Vec<u8>| {
            let request: S::Request = serde_rosmsg::from_slice(&body)
                .map_err(|e| format!("failed to decode request: {e}"))?;
            match handler(request) {
                Ok(response) => serde_rosmsg::to_vec(&response)
                    .map_err(|e| format!("failed to encode response: {e}")),
                Err(e) => Err(e.to_string()),
            }
        });

        let (tx, rx) = mpsc::channel(service_server::PROVIDER_INBOX);
        let (alive_tx, alive_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .node_tx
            .send(NodeMsg::ServiceProviderNew {
                abs_service: abs_service.clone(),
                sender: tx.clone(),
                alive: alive_rx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| Error::Cancelled)?;
        reply_rx.await.map_err(|_| Error::Cancelled)??;

        let provider = Provider {
            abs_service,
            service_type: S::ROS_SERVICE_NAME.to_owned(),
            md5sum: S::MD5SUM.to_owned(),
            request_type: format!("{}Request", S::ROS_SERVICE_NAME),
            response_type: format!("{}Response", S::ROS_SERVICE_NAME),
            caller_id: self.inner.node_name.clone(),
            handler: erased,
            master: self.inner.master.clone(),
            tcpros_uri: self.inner.tcpros_uri.clone(),
            node_tx: self.inner.node_tx.clone(),
            shutdown: self.inner.shutdown.clone(),
            conn_tasks: Vec::new(),
        };
        tokio::spawn(provider.run(rx, alive_tx));
        Ok(ServiceProvider::new(service, tx))
    }

    /// Creates a client for `service`. A persistent client reuses its
    /// connection across calls.
    pub fn service_client<S: RosServiceType>(
        &self,
        service: &str,
        persistent: bool,
    ) -> Result<ServiceClient<S>> {
        names::validate_graph_name(service)?;
        let abs_service = names::resolve(&self.inner.conf.namespace, service);
        Ok(ServiceClient::new(
            abs_service,
            self.inner.node_name.clone(),
            persistent,
            self.inner.master.clone(),
            self.inner.shutdown.clone(),
        ))
    }

    /// Current time: the wall clock, or the simulated clock when enabled.
    pub fn now(&self) -> Time {
        self.inner.sim.now()
    }

    /// Sleeps for `duration` of wall or simulated time.
    ///
    /// Under the simulated clock this returns only once a `/clock` message
    /// with a value at or past the target arrives, never before.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let mut shutdown = self.inner.shutdown.clone();
        if *shutdown.borrow() {
            return Err(Error::Cancelled);
        }
        match self.inner.sim.register_sleep(duration) {
            None => {
                tokio::select! {
                    _ = shutdown.changed() => Err(Error::Cancelled),
                    _ = tokio::time::sleep(duration.into()) => Ok(()),
                }
            }
            Some(released) => {
                tokio::select! {
                    _ = shutdown.changed() => Err(Error::Cancelled),
                    result = released => result.map_err(|_| Error::Cancelled),
                }
            }
        }
    }

    /// Publishes a log record on `/rosout` and mirrors it to the log facade.
    pub async fn log_message(&self, level: u8, msg: impl Into<String>) -> Result<()> {
        let msg = msg.into();
        match level {
            rosgraph_msgs::Log::DEBUG => debug!("{msg}"),
            rosgraph_msgs::Log::WARN => warn!("{msg}"),
            rosgraph_msgs::Log::ERROR | rosgraph_msgs::Log::FATAL => error!("{msg}"),
            _ => info!("{msg}"),
        }
        if let Some(publisher) = self.inner.rosout.get() {
            let record = rosgraph_msgs::Log {
                header: std_msgs::Header {
                    seq: 0,
                    stamp: self.now(),
                    frame_id: String::new(),
                },
                level,
                name: self.inner.node_name.clone(),
                msg,
                file: String::new(),
                function: String::new(),
                line: 0,
                topics: Vec::new(),
            };
            publisher.publish(&record).await?;
        }
        Ok(())
    }

    pub async fn get_param<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.inner.params.get(key).await
    }

    pub async fn set_param(&self, key: &str, value: impl Serialize) -> Result<()> {
        self.inner.params.set(key, value).await
    }

    pub async fn has_param(&self, key: &str) -> Result<bool> {
        self.inner.params.has(key).await
    }

    pub async fn delete_param(&self, key: &str) -> Result<()> {
        self.inner.params.delete(key).await
    }

    pub async fn search_param(&self, key: &str) -> Result<String> {
        self.inner.params.search(key).await
    }

    /// Resolves the slave API URI of another node via the master.
    pub async fn lookup_node(&self, name: &str) -> Result<String> {
        self.inner.master.lookup_node(name).await
    }

    /// Closes the node and everything created from it: servers stop accepting,
    /// orphan connections close, and every publisher, subscriber and service
    /// provider deregisters from the master before this returns.
    pub async fn close(&self) {
        let _ = self.inner.cancel.send(true);
        let mut done = self.inner.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
        self.inner.sim.close();
    }
}

/// Picks the local address other nodes should use to reach this one.
///
/// The original walks the OS interfaces for the subnet containing the master;
/// here a loopback master means loopback, anything else means the primary
/// local address.
fn default_host(master_addr: &SocketAddr) -> Result<String> {
    if master_addr.ip().is_loopback() {
        return Ok("127.0.0.1".to_owned());
    }
    let ip = local_ip_address::local_ip()
        .map_err(|e| Error::ConfigInvalid(format!("unable to select a host automatically: {e}")))?;
    Ok(ip.to_string())
}

async fn tcp_accept_loop(
    listener: TcpListener,
    node_tx: mpsc::Sender<NodeMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    trace!("Accepted tcpros connection from {addr}");
                    if node_tx.send(NodeMsg::TcpConnNew { stream }).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to accept tcpros connection: {e}"),
            },
        }
    }
    debug!("TCPROS accept loop exited");
}

async fn udp_recv_loop(
    socket: Arc<UdpSocket>,
    node_tx: mpsc::Sender<NodeMsg>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, source)) => match FrameHeader::decode(&buf[..len]) {
                    Ok((header, payload)) => {
                        let msg = NodeMsg::UdpFrame {
                            header,
                            payload: payload.to_vec(),
                            source,
                        };
                        if node_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    // Malformed datagrams are dropped with no error surfaced
                    Err(e) => trace!("Dropping datagram from {source}: {e}"),
                },
                Err(e) => warn!("Failed to receive datagram: {e}"),
            },
        }
    }
    debug!("UDPROS receive loop exited");
}
