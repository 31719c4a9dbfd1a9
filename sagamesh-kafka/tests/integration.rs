//! Integration test for `sagamesh-kafka` against a real Kafka-compatible
//! broker (Redpanda, via `testcontainers`).
use futures::StreamExt;
use sagamesh::bus::{Publisher, Subscriber};
use sagamesh::message::{Message, ShutdownHandle};
use sagamesh_kafka::KafkaBus;
use std::collections::HashMap;
use testcontainers::{clients::Cli, core::WaitFor, images::generic::GenericImage, Container};

fn start_redpanda() -> (Cli, Container<GenericImage>, String) {
    let docker = Cli::default();
    let image = GenericImage::new("docker.redpanda.com/redpanda/redpanda", "v23.3.8")
        .with_wait_for(WaitFor::message("Started Kafka API"));
    let container = docker.run(image);
    let port = container.get_host_port_ipv4(9092);
    (docker, container, format!("127.0.0.1:{port}"))
}

#[tokio::test]
#[ignore]
async fn publish_then_subscribe_round_trips_through_a_real_broker() {
    let (_cli, _node, brokers) = start_redpanda();
    let (_handle, shutdown) = ShutdownHandle::new();
    let bus = KafkaBus::connect(brokers, "sagamesh-kafka-test", shutdown).expect("connect");

    let topic = "onboarding.user_created";
    let mut stream = bus.subscribe(topic).await.expect("subscribe");

    let mut metadata = HashMap::new();
    metadata.insert("user_id".to_string(), "42".to_string());
    bus.publish(topic, Message::new(b"{}".to_vec(), metadata)).await.expect("publish");

    let delivery = stream.next().await.expect("a delivery arrives");
    assert_eq!(delivery.message().user_id(), Some("42"));
    delivery.ack();
}
