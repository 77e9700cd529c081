//! Topic subscribing: the `Subscriber` handle users hold, the per-topic
//! `Subscription` actor, and one `PublisherLink` task per remote publisher.
//!
//! Each link walks resolve -> connect -> stream: it asks the remote slave API
//! for transport parameters, performs the handshake (or registers the UDP
//! relation with the node loop), then decodes bodies and invokes the user
//! callback. On failure it backs off exponentially, capped at five seconds,
//! and starts over.

use crate::master_client::xmlrpc_call;
use crate::node::actor::{next_link_token, BusInfoEntry, NodeMsg, UdpLink};
use crate::tcpros::{self, ConnectionHeader};
use crate::udpros::Reassembler;
use abort_on_drop::ChildTask;
use byteorder::{LittleEndian, WriteBytesExt};
use log::*;
use rosnative_common::Error;
use serde_xmlrpc::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};

pub(crate) const SUBSCRIPTION_INBOX: usize = 64;
const LINK_FRAME_QUEUE: usize = 64;
const INITIAL_BACKOFF: std::time::Duration = std::time::Duration::from_millis(250);
const MAX_BACKOFF: std::time::Duration = std::time::Duration::from_secs(5);

/// Transport preference used when negotiating with publishers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

pub(crate) enum SubscriptionMsg {
    /// The authoritative publisher URI list, from registration or from an
    /// inbound publisherUpdate call.
    PublisherUpdate(Vec<String>),
    GetBusInfo {
        reply: oneshot::Sender<Vec<BusInfoEntry>>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// The subscriber handle returned by subscribing to a topic.
pub struct Subscriber {
    topic: String,
    sender: mpsc::Sender<SubscriptionMsg>,
}

impl Subscriber {
    pub(crate) fn new(topic: &str, sender: mpsc::Sender<SubscriptionMsg>) -> Self {
        Subscriber {
            topic: topic.to_owned(),
            sender,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Closes the subscription: disconnects from every publisher and
    /// deregisters from the master before returning.
    pub async fn close(self) {
        let (done, ack) = oneshot::channel();
        if self
            .sender
            .send(SubscriptionMsg::Close { done })
            .await
            .is_ok()
        {
            let _ = ack.await;
        }
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        let (done, _) = oneshot::channel();
        let _ = self.sender.try_send(SubscriptionMsg::Close { done });
    }
}

pub(crate) struct LinkShared {
    connected: AtomicBool,
    transport: Mutex<&'static str>,
}

impl LinkShared {
    fn new() -> Self {
        LinkShared {
            connected: AtomicBool::new(false),
            transport: Mutex::new("TCPROS"),
        }
    }

    fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn set_transport(&self, transport: &'static str) {
        *self.transport.lock().unwrap() = transport;
    }

    fn transport(&self) -> &'static str {
        *self.transport.lock().unwrap()
    }
}

pub(crate) struct PublisherLink {
    connection_id: u32,
    cancel: watch::Sender<bool>,
    task: ChildTask<()>,
    shared: Arc<LinkShared>,
}

/// Per-topic actor owned jointly by the user handle and the node registry.
pub(crate) struct Subscription {
    pub(crate) abs_topic: String,
    pub(crate) topic_type: String,
    pub(crate) md5sum: String,
    pub(crate) definition: String,
    pub(crate) caller_id: String,
    pub(crate) protocol: Protocol,
    pub(crate) callback: Arc<dyn Fn(&[u8]) + Send + Sync>,
    pub(crate) host: String,
    pub(crate) udpros_port: u16,
    pub(crate) udp_max_payload: usize,
    pub(crate) master: Arc<crate::master_client::MasterClient>,
    pub(crate) slave_uri: String,
    pub(crate) node_tx: mpsc::Sender<NodeMsg>,
    pub(crate) shutdown: watch::Receiver<bool>,
    pub(crate) http: reqwest::Client,
    pub(crate) links: HashMap<String, PublisherLink>,
    pub(crate) next_link_id: u32,
}

impl Subscription {
    pub(crate) async fn run(
        mut self,
        mut rx: mpsc::Receiver<SubscriptionMsg>,
        _alive: oneshot::Sender<()>,
    ) {
        debug!("Subscription loop started for {}", self.abs_topic);
        let mut shutdown = self.shutdown.clone();
        let mut close_ack = None;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                msg = rx.recv() => match msg {
                    None => break,
                    Some(SubscriptionMsg::Close { done }) => {
                        close_ack = Some(done);
                        break;
                    }
                    Some(SubscriptionMsg::PublisherUpdate(uris)) => self.apply_update(uris).await,
                    Some(SubscriptionMsg::GetBusInfo { reply }) => {
                        let _ = reply.send(self.bus_info());
                    }
                },
            }
        }

        // Refuse new work first so the node loop never blocks on us mid-cleanup
        rx.close();
        for (_, link) in self.links.drain() {
            let _ = link.cancel.send(true);
            let _ = link.task.await;
        }
        if let Err(e) = self
            .master
            .unregister_subscriber(&self.abs_topic, &self.slave_uri)
            .await
        {
            debug!("Failed to unregister subscriber for {}: {e}", self.abs_topic);
        }
        let _ = self
            .node_tx
            .send(NodeMsg::SubscriberClosed {
                abs_topic: self.abs_topic.clone(),
            })
            .await;
        if let Some(done) = close_ack {
            let _ = done.send(());
        }
        debug!("Subscription loop exited for {}", self.abs_topic);
    }

    /// Diffs the new URI list against the running links: new publishers get a
    /// link spawned, vanished ones are cancelled and awaited before returning,
    /// so the update is fully applied before the next message is handled.
    async fn apply_update(&mut self, uris: Vec<String>) {
        let target: HashSet<String> = uris.into_iter().collect();
        let stale: Vec<String> = self
            .links
            .keys()
            .filter(|uri| !target.contains(*uri))
            .cloned()
            .collect();
        for uri in stale {
            if let Some(link) = self.links.remove(&uri) {
                debug!("Publisher {uri} disappeared from {}", self.abs_topic);
                let _ = link.cancel.send(true);
                let _ = link.task.await;
            }
        }
        for uri in target {
            if !self.links.contains_key(&uri) {
                self.spawn_link(uri);
            }
        }
    }

    fn spawn_link(&mut self, uri: String) {
        debug!("Connecting to publisher {uri} for {}", self.abs_topic);
        self.next_link_id += 1;
        let (cancel, cancel_rx) = watch::channel(false);
        let shared = Arc::new(LinkShared::new());
        let ctx = LinkContext {
            uri: uri.clone(),
            abs_topic: self.abs_topic.clone(),
            topic_type: self.topic_type.clone(),
            md5sum: self.md5sum.clone(),
            definition: self.definition.clone(),
            caller_id: self.caller_id.clone(),
            protocol: self.protocol,
            callback: self.callback.clone(),
            host: self.host.clone(),
            udpros_port: self.udpros_port,
            udp_max_payload: self.udp_max_payload,
            node_tx: self.node_tx.clone(),
            http: self.http.clone(),
            shared: shared.clone(),
            udp_token: Mutex::new(None),
        };
        let node_shutdown = self.shutdown.clone();
        let task = tokio::spawn(link_task(ctx, cancel_rx, node_shutdown));
        self.links.insert(
            uri,
            PublisherLink {
                connection_id: self.next_link_id,
                cancel,
                task: task.into(),
                shared,
            },
        );
    }

    fn bus_info(&self) -> Vec<BusInfoEntry> {
        self.links
            .iter()
            .map(|(uri, link)| BusInfoEntry {
                connection_id: link.connection_id as i32,
                destination_id: uri.clone(),
                direction: "i",
                transport: link.shared.transport(),
                topic: self.abs_topic.clone(),
                connected: link.shared.is_connected(),
                info: String::new(),
            })
            .collect()
    }
}

struct LinkContext {
    uri: String,
    abs_topic: String,
    topic_type: String,
    md5sum: String,
    definition: String,
    caller_id: String,
    protocol: Protocol,
    callback: Arc<dyn Fn(&[u8]) + Send + Sync>,
    host: String,
    udpros_port: u16,
    udp_max_payload: usize,
    node_tx: mpsc::Sender<NodeMsg>,
    http: reqwest::Client,
    shared: Arc<LinkShared>,
    udp_token: Mutex<Option<u64>>,
}

/// Connection state machine for one remote publisher, driven until the link
/// is cancelled or the node shuts down.
async fn link_task(
    ctx: LinkContext,
    mut cancel: watch::Receiver<bool>,
    mut node_shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        if *cancel.borrow() || *node_shutdown.borrow() {
            break;
        }
        let error = tokio::select! {
            _ = cancel.changed() => break,
            _ = node_shutdown.changed() => break,
            error = run_link(&ctx) => error,
        };
        let had_connected = ctx.shared.is_connected();
        ctx.shared.set_connected(false);
        release_udp_link(&ctx).await;
        debug!(
            "Connection to publisher {} for {} ended: {error}",
            ctx.uri, ctx.abs_topic
        );
        // A fresh failure doubles the wait; a failure after a working
        // connection starts the schedule over
        backoff = if had_connected {
            INITIAL_BACKOFF
        } else {
            (backoff * 2).min(MAX_BACKOFF)
        };
        tokio::select! {
            _ = cancel.changed() => break,
            _ = node_shutdown.changed() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
    ctx.shared.set_connected(false);
    release_udp_link(&ctx).await;
}

/// Deregisters the UDP relation from the node loop, if one was registered.
async fn release_udp_link(ctx: &LinkContext) {
    let token = ctx.udp_token.lock().unwrap().take();
    if let Some(token) = token {
        let (done, ack) = oneshot::channel();
        if ctx
            .node_tx
            .send(NodeMsg::UdpLinkClosed { token, done })
            .await
            .is_ok()
        {
            let _ = ack.await;
        }
    }
}

/// One pass of the state machine: resolve transport parameters, connect,
/// stream until the connection dies. Only ever returns an error.
async fn run_link(ctx: &LinkContext) -> Error {
    let protocols = match ctx.protocol {
        Protocol::Tcp => vec![Value::Array(vec!["TCPROS".into()])],
        Protocol::Udp => {
            let header = ConnectionHeader {
                caller_id: ctx.caller_id.clone(),
                topic: Some(ctx.abs_topic.clone()),
                topic_type: ctx.topic_type.clone(),
                md5sum: Some(ctx.md5sum.clone()),
                msg_definition: ctx.definition.clone(),
                ..Default::default()
            };
            vec![Value::Array(vec![
                "UDPROS".into(),
                Value::Base64(header.to_bytes()),
                ctx.host.as_str().into(),
                Value::Int(ctx.udpros_port as i32),
                Value::Int(ctx.udp_max_payload as i32),
            ])]
        }
    };
    let params: Vec<Value> = match xmlrpc_call(
        &ctx.http,
        &ctx.uri,
        "requestTopic",
        vec![
            ctx.caller_id.as_str().into(),
            ctx.abs_topic.as_str().into(),
            Value::Array(protocols),
        ],
    )
    .await
    {
        Ok(params) => params,
        Err(e) => return e,
    };

    match params.first() {
        Some(Value::String(name)) if name == "TCPROS" => stream_tcp(ctx, &params).await,
        Some(Value::String(name)) if name == "UDPROS" => stream_udp(ctx, &params).await,
        _ => Error::Malformed(format!(
            "unusable requestTopic response from {}",
            ctx.uri
        )),
    }
}

async fn stream_tcp(ctx: &LinkContext, params: &[Value]) -> Error {
    let (Some(Value::String(host)), Some(Value::Int(port))) = (params.get(1), params.get(2)) else {
        return Error::Malformed(format!("bad TCPROS parameters from {}", ctx.uri));
    };
    let Ok(port) = u16::try_from(*port) else {
        return Error::Malformed(format!("bad TCPROS port from {}", ctx.uri));
    };
    let mut stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => return e.into(),
    };

    let request = ConnectionHeader {
        caller_id: ctx.caller_id.clone(),
        topic: Some(ctx.abs_topic.clone()),
        topic_type: ctx.topic_type.clone(),
        md5sum: Some(ctx.md5sum.clone()),
        msg_definition: ctx.definition.clone(),
        tcp_nodelay: Some(false),
        ..Default::default()
    };
    if let Err(e) = tcpros::write_header(&mut stream, &request).await {
        return e;
    }
    let reply = match tcpros::read_header(&mut stream).await {
        Ok(reply) => reply,
        Err(e) => return e,
    };
    if let Some(error) = reply.error {
        return Error::HandshakeMismatch(error);
    }
    if let Err(reason) = reply.validate_against(&ctx.md5sum, &ctx.topic_type) {
        return Error::HandshakeMismatch(reason);
    }

    info!("Connected to publisher {} for {}", ctx.uri, ctx.abs_topic);
    ctx.shared.set_transport("TCPROS");
    ctx.shared.set_connected(true);
    loop {
        match tcpros::read_body(&mut stream).await {
            Ok(body) => (ctx.callback)(&body),
            Err(e) => return e,
        }
    }
}

async fn stream_udp(ctx: &LinkContext, params: &[Value]) -> Error {
    // [UDPROS, host, port, connection_id, md5sum, type, definition]
    let (Some(Value::String(host)), Some(Value::Int(port)), Some(Value::Int(connection_id))) =
        (params.get(1), params.get(2), params.get(3))
    else {
        return Error::Malformed(format!("bad UDPROS parameters from {}", ctx.uri));
    };
    if let Some(Value::String(md5sum)) = params.get(4) {
        if md5sum != "*" && *md5sum != ctx.md5sum {
            return Error::HandshakeMismatch(format!(
                "md5sums do not match, expected {} received {md5sum}",
                ctx.md5sum
            ));
        }
    }
    let connection_id = *connection_id as u32;
    let port = u16::try_from(*port).unwrap_or(0);
    let remote_ip = match tokio::net::lookup_host((host.as_str(), port)).await {
        Ok(mut addrs) => match addrs.next() {
            Some(addr) => addr.ip(),
            None => return Error::Malformed(format!("unable to resolve {host}")),
        },
        Err(e) => return e.into(),
    };

    // Register the relation so the node loop routes matching datagrams here
    let (frames, mut frames_rx) = mpsc::channel(LINK_FRAME_QUEUE);
    let token = next_link_token();
    if ctx
        .node_tx
        .send(NodeMsg::UdpLinkNew {
            link: UdpLink {
                token,
                connection_id,
                remote_ip,
                sender: frames,
            },
        })
        .await
        .is_err()
    {
        return Error::Cancelled;
    }
    *ctx.udp_token.lock().unwrap() = Some(token);

    info!(
        "Receiving datagrams from publisher {} for {}",
        ctx.uri, ctx.abs_topic
    );
    ctx.shared.set_transport("UDPROS");
    ctx.shared.set_connected(true);
    let mut reassembler = Reassembler::new();
    loop {
        match frames_rx.recv().await {
            None => return Error::Cancelled,
            Some((header, payload)) => {
                if let Some(message) = reassembler.push(header, payload) {
                    (ctx.callback)(&prefix_body(message));
                }
            }
        }
    }
}

/// Re-attaches the length prefix a reassembled datagram body lacks, matching
/// the form the message codec consumes.
fn prefix_body(message: Vec<u8>) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + message.len());
    body.write_u32::<LittleEndian>(message.len() as u32).unwrap();
    body.extend_from_slice(&message);
    body
}
