//! # rosnative_common
//! This crate provides the common types and traits used throughout the rosnative workspace.

/// The central error type used throughout rosnative.
///
/// All user-facing functions in the runtime return this type so failure kinds stay
/// in one place. Transport-level errors on streaming connections are handled
/// internally (reconnect loops); only the failures the caller can act on surface here.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A bad name, namespace, or master address was supplied at construction.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    /// A publisher, subscriber, or service provider already exists on this node
    /// under the same absolute name.
    #[error("name conflict: {0}")]
    NameConflict(String),
    /// Communication with the master failed at the transport level.
    ///
    /// Registrations are not self-healing: the entity that got this error was
    /// never registered and must be recreated.
    #[error("unable to reach the master: {0}")]
    MasterUnavailable(String),
    /// The master answered, but with a non-success status code.
    #[error("master rejected the request: {0}")]
    RegistrationRejected(String),
    /// The remote end of a TCPROS handshake advertised a different type or md5sum.
    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),
    /// The peer disconnected, or the connection was closed locally.
    #[error("transport closed")]
    TransportClosed,
    /// The node or the entity was closed while the operation was in flight.
    #[error("operation cancelled by shutdown")]
    Cancelled,
    /// A service call or a slave API call exceeded its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),
    /// A wire frame failed decoding.
    #[error("malformed wire data: {0}")]
    Malformed(String),
    /// A message body could not be encoded or decoded against its Rust type.
    ///
    /// This is also returned when decoding succeeds structurally but the
    /// payload does not match the expected schema.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// A fundamental networking error: ports unavailable, dns failures, etc.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    /// Anything that doesn't cleanly fit the other categories.
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

/// Generic result type used throughout rosnative.
pub type Result<T> = std::result::Result<T, Error>;

/// Fundamental trait for the message types this crate works with.
///
/// Hand-declared message types (see the rosnative_msgs crate) satisfy this trait by
/// carrying the ROS package tag, the md5 fingerprint of their textual definition,
/// and the definition itself, which together drive the TCPROS/UDPROS handshakes.
pub trait RosMessageType:
    'static + serde::de::DeserializeOwned + Send + serde::Serialize + Sync + Clone + std::fmt::Debug
{
    /// Expected to be the combination pkg_name/type_name string describing the type.
    /// Example: std_msgs/Header
    const ROS_TYPE_NAME: &'static str;

    /// The computed md5sum of the message file and its dependencies.
    const MD5SUM: &'static str = "";

    /// The full definition from the msg or srv file, dependencies expanded.
    const DEFINITION: &'static str = "";
}

// This special impl allows for services with no args / returns
impl RosMessageType for () {
    const ROS_TYPE_NAME: &'static str = "";
    const MD5SUM: &'static str = "";
    const DEFINITION: &'static str = "";
}

/// Represents a ROS service type definition corresponding to a `.srv` file.
///
/// Used by service providers and service clients to agree on the request and
/// response schemas and on the service md5sum.
pub trait RosServiceType: 'static + Send + Sync {
    /// Name of the ros service e.g. `rospy_tutorials/AddTwoInts`
    const ROS_SERVICE_NAME: &'static str;
    /// The computed md5sum of the service file and its dependencies
    const MD5SUM: &'static str;
    /// The type of data being sent in the request
    type Request: RosMessageType;
    /// The type of the data being returned in the response
    type Response: RosMessageType;
}

/// This trait describes a function which can validly act as a ROS service
/// handler. We're really just using this as a trait alias as the full
/// definition is overly verbose and trait aliases are unstable.
pub trait ServiceFn<T: RosServiceType>:
    Fn(
        T::Request,
    ) -> std::result::Result<T::Response, Box<dyn std::error::Error + 'static + Send + Sync>>
    + Send
    + Sync
    + 'static
{
}

/// Automatic implementation of ServiceFn for Fn
impl<T, F> ServiceFn<T> for F
where
    T: RosServiceType,
    F: Fn(
            T::Request,
        )
            -> std::result::Result<T::Response, Box<dyn std::error::Error + 'static + Send + Sync>>
        + Send
        + Sync
        + 'static,
{
}

/// Integral time types shared by messages and the runtime's clock handling.
pub mod time;
pub use time::{Duration, Time};
