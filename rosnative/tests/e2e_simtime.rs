mod common;

use common::{wait_for, MasterStub};
use rosnative::{Duration as RosDuration, Node, NodeConf, Time};
use rosnative_msgs::rosgraph_msgs;
use serde_xmlrpc::Value;
use std::time::Duration;

fn conf(name: &str, master: &str) -> NodeConf {
    let mut conf = NodeConf::new(name);
    conf.master_address = master.to_owned();
    conf
}

/// Publishes `value` on /clock until the observing node reports it.
async fn drive_clock(
    publisher: &rosnative::Publisher<rosgraph_msgs::Clock>,
    observer: &Node,
    value: Time,
) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while observer.now() != value && tokio::time::Instant::now() < deadline {
        publisher
            .publish(&rosgraph_msgs::Clock { clock: value })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(observer.now(), value);
}

#[test_log::test(tokio::test)]
async fn sleep_waits_for_the_simulated_clock() {
    let master = MasterStub::start().await;
    master.set_param("/use_sim_time", Value::Bool(true));

    let n1 = Node::new(conf("sim", &master.address)).await.unwrap();
    let n2 = Node::new(conf("clock", &master.address)).await.unwrap();
    // Before any clock message the simulated time is the epoch
    assert_eq!(n1.now(), Time::default());

    let clock = n2
        .advertise::<rosgraph_msgs::Clock>("/clock", false)
        .await
        .unwrap();

    // Sleep for 5s of simulated time before the clock ever ticked
    let sleeper = n1.clone();
    let sleep_task =
        tokio::spawn(async move { sleeper.sleep(RosDuration::from_secs(5)).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!sleep_task.is_finished());

    // First tick at t=10 rebases the pending sleep to t=15
    drive_clock(&clock, &n1, Time::new(10, 0)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!sleep_task.is_finished());

    drive_clock(&clock, &n1, Time::new(14, 0)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!sleep_task.is_finished());

    // Reaching the rebased target releases the sleep
    drive_clock(&clock, &n1, Time::new(15, 0)).await;
    assert!(wait_for(Duration::from_secs(2), || sleep_task.is_finished()).await);
    assert!(matches!(sleep_task.await, Ok(Ok(()))));

    n1.close().await;
    n2.close().await;
    master.stop();
}

#[test_log::test(tokio::test)]
async fn sleep_cancelled_by_node_close() {
    let master = MasterStub::start().await;
    master.set_param("/use_sim_time", Value::Bool(true));

    let node = Node::new(conf("sim", &master.address)).await.unwrap();
    let sleeper = node.clone();
    let sleep_task =
        tokio::spawn(async move { sleeper.sleep(RosDuration::from_secs(60)).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!sleep_task.is_finished());

    node.close().await;
    assert!(wait_for(Duration::from_secs(2), || sleep_task.is_finished()).await);
    assert!(matches!(
        sleep_task.await,
        Ok(Err(rosnative::Error::Cancelled))
    ));
    master.stop();
}

#[test_log::test(tokio::test)]
async fn wall_clock_sleep_when_sim_time_is_off() {
    let master = MasterStub::start().await;
    let node = Node::new(conf("walltime", &master.address)).await.unwrap();

    let before = std::time::Instant::now();
    node.sleep(RosDuration::new(0, 50_000_000)).await.unwrap();
    assert!(before.elapsed() >= Duration::from_millis(45));
    assert!(node.now() > Time::default());

    node.close().await;
    master.stop();
}
