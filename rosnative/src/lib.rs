//! # rosnative
//! A pure-Rust client runtime for ROS1-style middleware: nodes register
//! publishers, subscribers and services with a central master over XML-RPC
//! and exchange typed messages peer-to-peer over the TCPROS and UDPROS
//! transports.
//!
//! Basic usage:
//!
//! ```no_run
//! use rosnative::{Node, NodeConf};
//! use rosnative_msgs::std_msgs;
//!
//! #[tokio::main]
//! async fn main() -> rosnative::Result<()> {
//!     let node = Node::new(NodeConf::new("listener")).await?;
//!     let _sub = node
//!         .subscribe::<std_msgs::String, _>("/chatter", |msg| {
//!             println!("got: {}", msg.data);
//!         })
//!         .await?;
//!     tokio::signal::ctrl_c().await.ok();
//!     node.close().await;
//!     Ok(())
//! }
//! ```
//!
//! Every node runs a coordinating loop that owns the registries and serializes
//! registrations, closures and inbound handshakes; each publisher, subscriber
//! and service provider then runs its own loop. See the module docs for the
//! moving parts.

mod master_client;
mod names;
pub mod node;
mod param_client;
mod publisher;
mod service_client;
mod service_server;
mod simtime;
mod subscriber;
pub(crate) mod tcpros;
pub(crate) mod udpros;

pub use node::{Node, NodeConf};
pub use publisher::Publisher;
pub use service_client::ServiceClient;
pub use service_server::ServiceProvider;
pub use subscriber::{Protocol, Subscriber};

pub use rosnative_common::{
    Duration, Error, Result, RosMessageType, RosServiceType, ServiceFn, Time,
};
