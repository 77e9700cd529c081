mod common;

use common::{wait_for, MasterStub};
use rosnative::{Node, NodeConf, Protocol};
use rosnative_msgs::std_msgs;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn conf(name: &str, master: &str) -> NodeConf {
    let mut conf = NodeConf::new(name);
    conf.master_address = master.to_owned();
    conf
}

#[test_log::test(tokio::test)]
async fn udp_subscriber_reassembles_fragmented_messages() {
    let master = MasterStub::start().await;
    let n1 = Node::new(conf("talker", &master.address)).await.unwrap();
    let n2 = Node::new(conf("listener", &master.address)).await.unwrap();

    // Well over the 1500 byte default payload, so the message fragments
    let blob: String = "0123456789abcdef".repeat(256);
    assert!(blob.len() > 4000);

    let publisher = n1.advertise::<std_msgs::String>("/blob", false).await.unwrap();
    let got: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let got_cb = got.clone();
    let _subscriber = n2
        .subscribe_with::<std_msgs::String, _>("/blob", Protocol::Udp, move |msg| {
            *got_cb.lock().unwrap() = Some(msg.data);
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while got.lock().unwrap().is_none() && tokio::time::Instant::now() < deadline {
        publisher
            .publish(&std_msgs::String { data: blob.clone() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(got.lock().unwrap().as_deref(), Some(blob.as_str()));

    n1.close().await;
    n2.close().await;
    assert!(wait_for(Duration::from_secs(2), || master.registration_count() == 0).await);
    master.stop();
}

#[test_log::test(tokio::test)]
async fn udp_subscriber_receives_small_messages_unfragmented() {
    let master = MasterStub::start().await;
    let n1 = Node::new(conf("talker", &master.address)).await.unwrap();
    let n2 = Node::new(conf("listener", &master.address)).await.unwrap();

    let publisher = n1.advertise::<std_msgs::String>("/small", false).await.unwrap();
    let got: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let got_cb = got.clone();
    let _subscriber = n2
        .subscribe_with::<std_msgs::String, _>("/small", Protocol::Udp, move |msg| {
            *got_cb.lock().unwrap() = Some(msg.data);
        })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while got.lock().unwrap().is_none() && tokio::time::Instant::now() < deadline {
        publisher
            .publish(&std_msgs::String {
                data: "ping".to_owned(),
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(got.lock().unwrap().as_deref(), Some("ping"));

    n1.close().await;
    n2.close().await;
    master.stop();
}
