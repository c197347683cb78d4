use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::metrics_consts::PRODUCER_QUEUE_DEPTH;

pub struct ProducerStatsContext;

impl ClientContext for ProducerStatsContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        metrics::gauge!(PRODUCER_QUEUE_DEPTH, "client" => stats.client_id)
            .set(stats.msg_cnt as f64);
    }
}

pub type TxProducer = FutureProducer<ProducerStatsContext>;

/// Create a producer and "ping" the brokers so a bad address fails at startup
pub fn create_producer(client_config: &ClientConfig) -> Result<TxProducer, KafkaError> {
    debug!("rdkafka producer configuration: {:?}", client_config);
    let producer: TxProducer = client_config.create_with_context(ProducerStatsContext)?;

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

    Ok(producer)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (timeout)")]
    KafkaProduceCanceled,
}

/// A message ready to be produced, already encoded
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub headers: Option<OwnedHeaders>,
}

/// Enqueue every message first, then await delivery reports. Results are
/// returned in input order.
pub async fn send_messages<C: ClientContext + 'static>(
    producer: &FutureProducer<C>,
    topic: &str,
    messages: impl IntoIterator<Item = OutgoingMessage>,
) -> Vec<Result<(), KafkaProduceError>> {
    let mut results = Vec::new();
    let mut handles = Vec::new();

    for (index, message) in messages.into_iter().enumerate() {
        let record = FutureRecord {
            topic,
            key: message.key.as_deref(),
            payload: Some(message.payload.as_slice()),
            timestamp: None,
            partition: None,
            headers: message.headers,
        };

        match producer.send_result(record) {
            Ok(delivery) => handles.push((index, delivery)),
            Err((e, _)) => {
                results.push((index, Err(KafkaProduceError::KafkaProduceError { error: e })))
            }
        }
    }

    for (index, delivery) in handles {
        match delivery.await {
            Ok(Ok(_)) => results.push((index, Ok(()))),
            Ok(Err((e, _))) => {
                results.push((index, Err(KafkaProduceError::KafkaProduceError { error: e })))
            }
            Err(_) => results.push((index, Err(KafkaProduceError::KafkaProduceCanceled))),
        }
    }

    results.sort_by_key(|(index, _)| *index);
    results.into_iter().map(|(_, result)| result).collect()
}
