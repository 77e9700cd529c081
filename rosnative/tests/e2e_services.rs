mod common;

use common::{wait_for, MasterStub};
use rosnative::{Error, Node, NodeConf, RosMessageType, RosServiceType};
use std::time::Duration;

fn conf(name: &str, master: &str) -> NodeConf {
    let mut conf = NodeConf::new(name);
    conf.master_address = master.to_owned();
    conf
}

#[derive(:: serde :: Deserialize, :: serde :: Serialize, Debug, Default, Clone, PartialEq)]
pub struct AddTwoIntsRequest {
    pub a: i64,
    pub b: i64,
}

impl RosMessageType for AddTwoIntsRequest {
    const ROS_TYPE_NAME: &'static str = "rospy_tutorials/AddTwoIntsRequest";
    const MD5SUM: &'static str = "36d09b846be0b371c5f190354dd3153e";
    const DEFINITION: &'static str = "int64 a\nint64 b";
}

#[derive(:: serde :: Deserialize, :: serde :: Serialize, Debug, Default, Clone, PartialEq)]
pub struct AddTwoIntsResponse {
    pub sum: i64,
}

impl RosMessageType for AddTwoIntsResponse {
    const ROS_TYPE_NAME: &'static str = "rospy_tutorials/AddTwoIntsResponse";
    const MD5SUM: &'static str = "b88405221c77b1878a3cbbfff53428d7";
    const DEFINITION: &'static str = "int64 sum";
}

pub struct AddTwoInts;

impl RosServiceType for AddTwoInts {
    const ROS_SERVICE_NAME: &'static str = "rospy_tutorials/AddTwoInts";
    const MD5SUM: &'static str = "6a2e34150c00229791cc89ff309fff21";
    type Request = AddTwoIntsRequest;
    type Response = AddTwoIntsResponse;
}

fn add_handler(
    request: AddTwoIntsRequest,
) -> Result<AddTwoIntsResponse, Box<dyn std::error::Error + Send + Sync>> {
    if request.a < 0 || request.b < 0 {
        return Err("only non-negative operands are supported".into());
    }
    Ok(AddTwoIntsResponse {
        sum: request.a + request.b,
    })
}

#[test_log::test(tokio::test)]
async fn service_round_trip_and_midcall_shutdown() {
    let master = MasterStub::start().await;
    let n1 = Node::new(conf("server", &master.address)).await.unwrap();
    let n2 = Node::new(conf("caller", &master.address)).await.unwrap();

    let provider = n1
        .advertise_service::<AddTwoInts, _>("/add", add_handler)
        .await
        .unwrap();
    assert!(master.has_service("/add"));

    let client = n2.service_client::<AddTwoInts>("/add", true).unwrap();
    let response = client
        .call(&AddTwoIntsRequest { a: 2, b: 3 })
        .await
        .unwrap();
    assert_eq!(response.sum, 5);

    // The provider goes away while the persistent client still holds its
    // connection: the next exchange must observe the closed transport
    provider.close().await;
    assert!(wait_for(Duration::from_secs(2), || !master.has_service("/add")).await);
    match client.call(&AddTwoIntsRequest { a: 1, b: 1 }).await {
        Err(Error::TransportClosed) => {}
        Ok(response) => panic!("expected TransportClosed, got response {}", response.sum),
        Err(other) => panic!("expected TransportClosed, got {other:?}"),
    }

    n1.close().await;
    n2.close().await;
    master.stop();
}

#[test_log::test(tokio::test)]
async fn handler_errors_reach_the_caller() {
    let master = MasterStub::start().await;
    let n1 = Node::new(conf("server", &master.address)).await.unwrap();
    let n2 = Node::new(conf("caller", &master.address)).await.unwrap();

    let _provider = n1
        .advertise_service::<AddTwoInts, _>("/add", add_handler)
        .await
        .unwrap();
    let client = n2.service_client::<AddTwoInts>("/add", false).unwrap();

    let err = client
        .call(&AddTwoIntsRequest { a: -1, b: 3 })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("non-negative"));

    // A non-persistent client reconnects per call, so the service still works
    let response = client
        .call(&AddTwoIntsRequest { a: 20, b: 22 })
        .await
        .unwrap();
    assert_eq!(response.sum, 42);

    n1.close().await;
    n2.close().await;
    master.stop();
}
