use rosnative::{Node, NodeConf};
use rosnative_msgs::std_msgs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let node = Node::new(NodeConf::new("talker_rs")).await?;
    let publisher = node.advertise::<std_msgs::String>("/chatter", false).await?;

    let mut count = 0u32;
    loop {
        publisher
            .publish(&std_msgs::String {
                data: format!("hello world {count}"),
            })
            .await?;
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        count += 1;
    }
}
