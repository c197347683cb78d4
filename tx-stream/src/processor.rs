use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::kafka::producer::{send_messages, OutgoingMessage, TxProducer};
use crate::kafka::types::Record;
use crate::metrics_consts::{
    MALFORMED_TRANSACTIONS_COUNTER, PUBLISH_DURATION_HISTOGRAM, TRANSACTIONS_PUBLISHED_COUNTER,
};
use crate::retry::NonRetryable;
use crate::transaction::{StoredTransaction, Transaction};

/// Turns a batch of records into durable side effects.
///
/// The outcome is all-or-nothing for the batch: an `Err` means the whole batch
/// is attempted again (or dead-lettered), so implementations must tolerate
/// seeing the same records more than once.
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process_records(&self, records: &[Record]) -> Result<()>;
}

/// Decode every record as a [`Transaction`] and project it. Records that are
/// not valid transactions are logged and skipped: retrying cannot fix them.
pub fn decode_transactions(records: &[Record]) -> Vec<StoredTransaction> {
    records
        .iter()
        .filter_map(
            |record| match serde_json::from_slice::<Transaction>(&record.value) {
                Ok(tx) => Some(StoredTransaction::from(tx)),
                Err(e) => {
                    warn!(
                        topic = %record.topic,
                        error = ?e,
                        "Skipping record that is not a valid transaction"
                    );
                    metrics::counter!(MALFORMED_TRANSACTIONS_COUNTER).increment(1);
                    None
                }
            },
        )
        .collect()
}

/// Publishes the stored projection of each transaction to the output topic,
/// keyed by transaction id so updates to one transaction stay ordered.
pub struct TransactionProcessor {
    producer: Arc<TxProducer>,
    output_topic: String,
}

impl TransactionProcessor {
    pub fn new(producer: Arc<TxProducer>, output_topic: String) -> Self {
        Self {
            producer,
            output_topic,
        }
    }
}

#[async_trait]
impl RecordProcessor for TransactionProcessor {
    async fn process_records(&self, records: &[Record]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let transactions = decode_transactions(records);
        if transactions.is_empty() {
            return Ok(());
        }

        let messages = transactions
            .iter()
            .map(|tx| {
                let payload = serde_json::to_vec(tx)
                    .map_err(|e| anyhow::Error::new(NonRetryable(e.to_string())))
                    .with_context(|| format!("failed to encode transaction {}", tx.transaction_id))?;
                Ok(OutgoingMessage {
                    key: Some(tx.transaction_id.clone().into_bytes()),
                    payload,
                    headers: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let started = Instant::now();
        let results = send_messages(&self.producer, &self.output_topic, messages).await;
        metrics::histogram!(PUBLISH_DURATION_HISTOGRAM).record(started.elapsed().as_secs_f64());

        let total = results.len();
        let mut failures: Vec<_> = results.into_iter().filter_map(Result::err).collect();
        let failed = failures.len();
        if !failures.is_empty() {
            metrics::counter!(TRANSACTIONS_PUBLISHED_COUNTER)
                .increment(u64::try_from(total - failed).unwrap_or_default());
            let first = failures.swap_remove(0);
            return Err(anyhow::Error::new(first).context(format!(
                "failed to publish {failed} of {total} transactions to {}",
                self.output_topic
            )));
        }

        metrics::counter!(TRANSACTIONS_PUBLISHED_COUNTER)
            .increment(u64::try_from(total).unwrap_or_default());
        debug!(
            topic = %self.output_topic,
            count = total,
            "Published transactions"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(value: &str) -> Record {
        Record {
            key: b"k".to_vec(),
            value: value.as_bytes().to_vec(),
            topic: "transactions".to_string(),
        }
    }

    #[test]
    fn test_decode_skips_malformed_records() {
        let records = vec![
            record(r#"{"transaction_id":"tx-1","amount":10.0,"currency":"USD"}"#),
            record("not json"),
            record(r#"{"transaction_id":"tx-2","amount":3.5,"status":"pending"}"#),
        ];

        let decoded = decode_transactions(&records);

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].transaction_id, "tx-1");
        assert_eq!(decoded[0].currency, "USD");
        assert_eq!(decoded[1].transaction_id, "tx-2");
        assert_eq!(decoded[1].status, "pending");
    }

    #[test]
    fn test_decode_rejects_wrong_field_types() {
        let records = vec![record(r#"{"transaction_id":"tx-1","amount":"ten"}"#)];

        assert!(decode_transactions(&records).is_empty());
    }
}
