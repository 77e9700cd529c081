use rosnative_common::{RosMessageType, Time};

#[derive(:: serde :: Deserialize, :: serde :: Serialize, Debug, Default, Clone, PartialEq)]
pub struct Header {
    pub seq: u32,
    pub stamp: Time,
    pub frame_id: std::string::String,
}

impl RosMessageType for Header {
    const ROS_TYPE_NAME: &'static str = "std_msgs/Header";
    const MD5SUM: &'static str = "2176decaecbce78abc3b96ef049fabed";
    const DEFINITION: &'static str = "uint32 seq\ntime stamp\nstring frame_id";
}

#[derive(:: serde :: Deserialize, :: serde :: Serialize, Debug, Default, Clone, PartialEq)]
pub struct String {
    pub data: std::string::String,
}

impl RosMessageType for String {
    const ROS_TYPE_NAME: &'static str = "std_msgs/String";
    const MD5SUM: &'static str = "992ce8a1687cec8c8bd883ec73ca41d1";
    const DEFINITION: &'static str = "string data";
}

#[derive(:: serde :: Deserialize, :: serde :: Serialize, Debug, Default, Clone, PartialEq)]
pub struct Int32 {
    pub data: i32,
}

impl RosMessageType for Int32 {
    const ROS_TYPE_NAME: &'static str = "std_msgs/Int32";
    const MD5SUM: &'static str = "da5909fbe378aeaf85e547e830cc1bb7";
    const DEFINITION: &'static str = "int32 data";
}

#[derive(:: serde :: Deserialize, :: serde :: Serialize, Debug, Default, Clone, PartialEq)]
pub struct Int64 {
    pub data: i64,
}

impl RosMessageType for Int64 {
    const ROS_TYPE_NAME: &'static str = "std_msgs/Int64";
    const MD5SUM: &'static str = "34add168574510e6e17f5d23ecc077ef";
    const DEFINITION: &'static str = "int64 data";
}

#[derive(:: serde :: Deserialize, :: serde :: Serialize, Debug, Default, Clone, PartialEq)]
pub struct Empty {}

impl RosMessageType for Empty {
    const ROS_TYPE_NAME: &'static str = "std_msgs/Empty";
    const MD5SUM: &'static str = "d41d8cd98f00b204e9800998ecf8427e";
    const DEFINITION: &'static str = "";
}
