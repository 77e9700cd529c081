//! # rosnative_msgs
//! A small catalog of ROS1 message types declared by hand in the shape the
//! msg-import generator would produce them: one struct per message, serde
//! derives for the wire codec, and the type name / md5sum / definition
//! constants the connection handshakes require.
//!
//! Only the packages the runtime itself needs are declared here; downstream
//! users declare their own types the same way.

pub mod rosgraph_msgs;
pub mod std_msgs;
