use crate::std_msgs;
use rosnative_common::{RosMessageType, Time};

#[derive(:: serde :: Deserialize, :: serde :: Serialize, Debug, Default, Clone, PartialEq)]
pub struct Clock {
    pub clock: Time,
}

impl RosMessageType for Clock {
    const ROS_TYPE_NAME: &'static str = "rosgraph_msgs/Clock";
    const MD5SUM: &'static str = "a9c97c1d230cfc112e270351a944ee47";
    const DEFINITION: &'static str = "time clock";
}

#[derive(:: serde :: Deserialize, :: serde :: Serialize, Debug, Default, Clone, PartialEq)]
pub struct Log {
    pub header: std_msgs::Header,
    pub level: u8,
    pub name: String,
    pub msg: String,
    pub file: String,
    pub function: String,
    pub line: u32,
    pub topics: Vec<String>,
}

impl Log {
    pub const DEBUG: u8 = 1;
    pub const INFO: u8 = 2;
    pub const WARN: u8 = 4;
    pub const ERROR: u8 = 8;
    pub const FATAL: u8 = 16;
}

impl RosMessageType for Log {
    const ROS_TYPE_NAME: &'static str = "rosgraph_msgs/Log";
    const MD5SUM: &'static str = "acffd30cd6b6de30f120938c17c593fb";
    const DEFINITION: &'static str = "byte DEBUG=1\nbyte INFO=2\nbyte WARN=4\nbyte ERROR=8\nbyte FATAL=16\nHeader header\nbyte level\nstring name\nstring msg\nstring file\nstring function\nuint32 line\nstring[] topics\n================================================================================\nMSG: std_msgs/Header\nuint32 seq\ntime stamp\nstring frame_id";
}
