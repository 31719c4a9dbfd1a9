//! Integration test for `sagamesh-nats` against a real NATS JetStream server.
use futures::StreamExt;
use sagamesh::bus::{Publisher, Subscriber};
use sagamesh::message::{Message, ShutdownHandle};
use sagamesh_nats::NatsBus;
use std::collections::HashMap;
use testcontainers::{clients::Cli, core::WaitFor, images::generic::GenericImage, Container};

fn start_nats() -> (Cli, Container<GenericImage>, String) {
    let docker = Cli::default();
    let image = GenericImage::new("nats", "2.10.8-alpine")
        .with_args(vec!["-js".to_string()])
        .with_wait_for(WaitFor::message("Server is ready"));
    let container = docker.run(image);
    let host_port = container.get_host_port_ipv4(4222);
    (docker, container, format!("nats://127.0.0.1:{host_port}"))
}

#[tokio::test]
#[ignore]
async fn publish_then_subscribe_round_trips_through_a_real_jetstream() {
    let (_cli, _node, addr) = start_nats();
    let (_handle, shutdown) = ShutdownHandle::new();
    let bus = NatsBus::connect(&addr, "sagamesh-nats-test", shutdown).await.expect("connect");

    let topic = "onboarding.user_created";
    let mut stream = bus.subscribe(topic).await.expect("subscribe");

    let mut metadata = HashMap::new();
    metadata.insert("user_id".to_string(), "42".to_string());
    bus.publish(topic, Message::new(b"{}".to_vec(), metadata)).await.expect("publish");

    let delivery = stream.next().await.expect("a delivery arrives");
    assert_eq!(delivery.message().user_id(), Some("42"));
    delivery.ack();
}
