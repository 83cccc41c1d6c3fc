use rdkafka::message::{BorrowedMessage, Message};

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

/// Position of a single consumed message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// The offset Kafka expects to be committed once this message is durable,
    /// i.e. the next offset to consume.
    pub fn committable_offset(&self) -> i64 {
        self.offset + 1
    }
}

/// An owned copy of a consumed message: payload bytes plus its coordinates.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub payload: Vec<u8>,
    pub position: PartitionOffset,
}

impl RawMessage {
    pub fn new(payload: Vec<u8>, position: PartitionOffset) -> Self {
        Self { payload, position }
    }

    pub fn from_borrowed(message: &BorrowedMessage<'_>) -> Self {
        Self {
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
            position: PartitionOffset::new(
                Partition::new(message.topic().to_owned(), message.partition()),
                message.offset(),
            ),
        }
    }
}
