use rosnative::{Node, NodeConf};
use rosnative_msgs::std_msgs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let node = Node::new(NodeConf::new("listener_rs")).await?;
    let subscriber = node
        .subscribe::<std_msgs::String, _>("/chatter", |msg| {
            log::info!("[/listener_rs] Got message: {}", msg.data);
        })
        .await?;

    tokio::signal::ctrl_c().await?;
    log::warn!("ctrl-c, exiting");
    subscriber.close().await;
    node.close().await;
    Ok(())
}
