use std::time::Duration;

use async_trait::async_trait;
use rdkafka::{
    error::KafkaError,
    message::{Header, OwnedHeaders},
    producer::{FutureProducer, FutureRecord, Producer},
    ClientConfig,
};
use tracing::{debug, error, info};

use crate::{config::KafkaConfig, error::QueueError};

use super::{Queue, QueueMessage};

pub struct KafkaQueue {
    producer: FutureProducer,
}

impl KafkaQueue {
    /// Builds a producer that waits for all in-sync replicas and never writes a
    /// message twice on its own retries, then pings the brokers.
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        };

        debug!("rdkafka configuration: {:?}", client_config);
        let producer: FutureProducer = client_config.create()?;

        match producer
            .client()
            .fetch_metadata(None, Duration::from_secs(15))
        {
            Ok(metadata) => {
                info!(
                    "Successfully connected to Kafka brokers. Found {} topics.",
                    metadata.topics().len()
                );
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                return Err(error);
            }
        }

        Ok(Self { producer })
    }

    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(timeout)
    }
}

fn owned_headers(message: &QueueMessage) -> OwnedHeaders {
    message.headers.iter().fold(
        OwnedHeaders::new_with_capacity(message.headers.len()),
        |headers, (key, value)| {
            headers.insert(Header {
                key,
                value: Some(value.as_str()),
            })
        },
    )
}

#[async_trait]
impl Queue for KafkaQueue {
    async fn publish(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let not_acked = |reason: String| QueueError::NotAcknowledged {
            destination: message.destination.clone(),
            reason,
        };

        let mut record = FutureRecord::<str, str>::to(&message.destination)
            .payload(&message.payload)
            .headers(owned_headers(message));
        if let Some(key) = &message.key {
            record = record.key(key.as_str());
        }

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| not_acked(e.to_string()))?;

        // The delivery future resolves once the broker acked (or gave up on) the
        // message under acks=all
        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((e, _))) => Err(not_acked(e.to_string())),
            Err(_) => Err(not_acked("delivery canceled".to_owned())),
        }
    }
}
