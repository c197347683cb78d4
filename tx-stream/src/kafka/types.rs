use std::collections::HashMap;
use std::fmt;

use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::topic_partition_list::TopicPartitionListElem;

/// Identity of a single partition of a topic. Used as the worker registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: String, partition_number: i32) -> Self {
        Self {
            topic,
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic().to_string(), elem.partition())
    }
}

/// An owned message as handed over by the consumer group client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumedRecord {
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl ConsumedRecord {
    pub fn from_borrowed_message(message: &BorrowedMessage<'_>) -> Self {
        Self {
            key: message.key().map(|k| k.to_vec()),
            value: message.payload().map(|v| v.to_vec()),
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
        }
    }

    pub fn partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}

/// The domain view of a record: what processors and the dead letter sink see
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub topic: String,
}

impl From<&ConsumedRecord> for Record {
    fn from(record: &ConsumedRecord) -> Self {
        Self {
            key: record.key.clone().unwrap_or_default(),
            value: record.value.clone().unwrap_or_default(),
            topic: record.topic.clone(),
        }
    }
}

/// Records fetched for one partition in a single poll, in fetch order.
///
/// `high_offset` is the commit marker: once the batch reaches a terminal
/// outcome the partition is marked at `high_offset + 1`.
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    partition: Partition,
    records: Vec<ConsumedRecord>,
    high_offset: Option<i64>,
}

impl FetchedBatch {
    pub fn new(partition: Partition, records: Vec<ConsumedRecord>) -> Self {
        let high_offset = records.iter().map(|r| r.offset).max();
        Self {
            partition,
            records,
            high_offset,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn records(&self) -> &[ConsumedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn first_offset(&self) -> Option<i64> {
        self.records.first().map(|r| r.offset)
    }

    /// Highest offset contained in the batch, None when empty
    pub fn high_offset(&self) -> Option<i64> {
        self.high_offset
    }

    /// Convert wire records into domain records
    pub fn to_records(&self) -> Vec<Record> {
        self.records.iter().map(Record::from).collect()
    }
}

/// A fetch problem scoped to a partition (or to no partition in particular).
/// These never stop the poll loop.
#[derive(Debug)]
pub struct FetchError {
    pub partition: Option<Partition>,
    pub error: anyhow::Error,
}

impl FetchError {
    pub fn new(partition: Option<Partition>, error: anyhow::Error) -> Self {
        Self { partition, error }
    }
}

/// Everything one poll returned
#[derive(Debug, Default)]
pub struct Fetches {
    pub batches: Vec<FetchedBatch>,
    pub errors: Vec<FetchError>,
}

impl Fetches {
    pub fn new(batches: Vec<FetchedBatch>, errors: Vec<FetchError>) -> Self {
        Self { batches, errors }
    }

    /// Group a flat stream of records into per-partition batches. Order within
    /// a partition is the order of the input; partitions appear in the order
    /// their first record was seen.
    pub fn from_records(records: Vec<ConsumedRecord>, errors: Vec<FetchError>) -> Self {
        let mut order: Vec<Partition> = Vec::new();
        let mut grouped: HashMap<Partition, Vec<ConsumedRecord>> = HashMap::new();

        for record in records {
            let partition = record.partition();
            match grouped.get_mut(&partition) {
                Some(records) => records.push(record),
                None => {
                    order.push(partition.clone());
                    grouped.insert(partition, vec![record]);
                }
            }
        }

        let batches = order
            .into_iter()
            .filter_map(|partition| {
                grouped
                    .remove(&partition)
                    .map(|records| FetchedBatch::new(partition, records))
            })
            .collect();

        Self { batches, errors }
    }

    pub fn record_count(&self) -> usize {
        self.batches.iter().map(FetchedBatch::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(partition: i32, offset: i64) -> ConsumedRecord {
        ConsumedRecord {
            key: Some(format!("k{offset}").into_bytes()),
            value: Some(format!("v{offset}").into_bytes()),
            topic: "transactions".to_string(),
            partition,
            offset,
        }
    }

    #[test]
    fn test_from_records_groups_by_partition_in_fetch_order() {
        let fetches = Fetches::from_records(
            vec![
                record(1, 10),
                record(0, 5),
                record(1, 11),
                record(0, 6),
                record(1, 12),
            ],
            vec![],
        );

        assert_eq!(fetches.batches.len(), 2);
        assert_eq!(fetches.record_count(), 5);

        let first = &fetches.batches[0];
        assert_eq!(first.partition(), &Partition::new("transactions".to_string(), 1));
        let offsets: Vec<i64> = first.records().iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![10, 11, 12]);
        assert_eq!(first.high_offset(), Some(12));

        let second = &fetches.batches[1];
        assert_eq!(second.partition(), &Partition::new("transactions".to_string(), 0));
        assert_eq!(second.first_offset(), Some(5));
        assert_eq!(second.high_offset(), Some(6));
    }

    #[test]
    fn test_empty_batch_has_no_commit_marker() {
        let batch = FetchedBatch::new(Partition::new("transactions".to_string(), 0), vec![]);
        assert!(batch.is_empty());
        assert_eq!(batch.high_offset(), None);
    }

    #[test]
    fn test_record_conversion_fills_missing_key_and_value() {
        let consumed = ConsumedRecord {
            key: None,
            value: None,
            topic: "transactions".to_string(),
            partition: 3,
            offset: 42,
        };

        let record = Record::from(&consumed);
        assert!(record.key.is_empty());
        assert!(record.value.is_empty());
        assert_eq!(record.topic, "transactions");
    }

    #[test]
    fn test_partition_display() {
        let partition = Partition::new("transactions".to_string(), 7);
        assert_eq!(partition.to_string(), "transactions:7");
    }
}
