//! Priority buckets drain highest first, in arrival order within a bucket.

use bytes::Bytes;
use ganglion_common::BrokerAddress;
use ganglion_queue::model::BasicProperties;
use ganglion_queue::{
    BrokerChannel, BrokerConnection, BrokerConnector, InMemoryBroker, QueueDeclareOptions,
};
use proptest::prelude::*;

fn drain(priorities: &[u8]) -> Vec<(u8, usize)> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    runtime.block_on(async {
        let broker = InMemoryBroker::new();
        let connection = broker.connect(&[BrokerAddress::default()]).await.unwrap();
        let channel = connection.open_channel().await.unwrap();
        channel
            .queue_declare("q", QueueDeclareOptions::work_queue())
            .await
            .unwrap();

        for (seq, priority) in priorities.iter().enumerate() {
            channel
                .basic_publish(
                    "",
                    "q",
                    BasicProperties::json().with_priority(*priority),
                    Bytes::from(seq.to_string()),
                )
                .await
                .unwrap();
        }

        let mut deliveries = channel.basic_consume("q", true).await.unwrap();
        let mut drained = Vec::new();
        while let Ok(delivery) = deliveries.try_recv() {
            let seq: usize = std::str::from_utf8(&delivery.body).unwrap().parse().unwrap();
            drained.push((delivery.properties.priority.unwrap_or(0), seq));
        }
        connection.close().await.unwrap();
        drained
    })
}

proptest! {
    #[test]
    fn drains_by_bucket_then_arrival(priorities in proptest::collection::vec(0u8..=5, 0..40)) {
        let drained = drain(&priorities);

        let mut expected: Vec<(u8, usize)> = priorities.iter().copied().zip(0..).collect();
        // priorities above the queue maximum share the top bucket
        expected.sort_by_key(|(priority, seq)| (std::cmp::Reverse((*priority).min(3)), *seq));

        prop_assert_eq!(drained, expected);
    }
}
