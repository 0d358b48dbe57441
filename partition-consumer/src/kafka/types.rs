use std::fmt;

use rdkafka::topic_partition_list::TopicPartitionListElem;

/// A partition of the subscribed topic. Assigned and revoked by the broker only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(i32);

impl PartitionId {
    pub fn new(partition_number: i32) -> Self {
        Self(partition_number)
    }

    pub fn partition_number(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for PartitionId {
    fn from(partition_number: i32) -> Self {
        Self::new(partition_number)
    }
}

impl From<TopicPartitionListElem<'_>> for PartitionId {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.partition())
    }
}

/// Render a partition set for log lines, e.g. `[0, 1, 4]`
pub fn format_partitions(partitions: &[PartitionId]) -> String {
    let numbers: Vec<String> = partitions.iter().map(|p| p.to_string()).collect();
    format!("[{}]", numbers.join(", "))
}
