use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use tracing::warn;

use crate::kafka::producer::{send_messages, OutgoingMessage, TxProducer};
use crate::kafka::types::Record;
use crate::metrics_consts::{DEAD_LETTER_FAILURES_COUNTER, DEAD_LETTER_RECORDS_COUNTER};

pub const SOURCE_TOPIC_HEADER: &str = "dlq_source_topic";

/// Side channel for batches that exhausted their processing attempts.
///
/// Delivery is best-effort. Dead-lettered records are kept for manual
/// inspection and are never replayed automatically.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, records: &[Record]) -> Result<()>;
}

/// Produces dead letters, key and value untouched, to a dedicated topic
pub struct KafkaDeadLetterSink {
    producer: Arc<TxProducer>,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(producer: Arc<TxProducer>, topic: String) -> Self {
        Self { producer, topic }
    }
}

fn dead_letter_message(record: &Record) -> OutgoingMessage {
    let headers = OwnedHeaders::new().insert(Header {
        key: SOURCE_TOPIC_HEADER,
        value: Some(record.topic.as_str()),
    });

    OutgoingMessage {
        key: (!record.key.is_empty()).then(|| record.key.clone()),
        payload: record.value.clone(),
        headers: Some(headers),
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send(&self, records: &[Record]) -> Result<()> {
        let messages = records.iter().map(dead_letter_message);
        let results = send_messages(&self.producer, &self.topic, messages).await;

        let mut failed = 0_u64;
        for (record, result) in records.iter().zip(&results) {
            if let Err(e) = result {
                failed += 1;
                warn!(
                    topic = %record.topic,
                    dlq_topic = %self.topic,
                    error = ?e,
                    "Failed to dead-letter record"
                );
            }
        }

        let delivered = u64::try_from(results.len())
            .unwrap_or_default()
            .saturating_sub(failed);
        metrics::counter!(DEAD_LETTER_RECORDS_COUNTER).increment(delivered);
        if failed > 0 {
            metrics::counter!(DEAD_LETTER_FAILURES_COUNTER).increment(failed);
            return Err(anyhow!(
                "{failed} of {} records could not be dead-lettered to {}",
                records.len(),
                self.topic
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdkafka::message::Headers;

    #[test]
    fn test_dead_letter_message_keeps_record_and_tags_source() {
        let record = Record {
            key: b"tx-1".to_vec(),
            value: b"{\"amount\":1}".to_vec(),
            topic: "transactions".to_string(),
        };

        let message = dead_letter_message(&record);

        assert_eq!(message.key.as_deref(), Some(&b"tx-1"[..]));
        assert_eq!(message.payload, record.value);
        let headers = message.headers.unwrap();
        let header = headers.get(0);
        assert_eq!(header.key, SOURCE_TOPIC_HEADER);
        assert_eq!(header.value, Some(&b"transactions"[..]));
    }

    #[test]
    fn test_dead_letter_message_without_key() {
        let record = Record {
            key: vec![],
            value: b"garbage".to_vec(),
            topic: "transactions".to_string(),
        };

        assert!(dead_letter_message(&record).key.is_none());
    }
}
