use avocet_common::ids::ProducerId;
use avocet_storage::Offset;
use parking_lot::Mutex;

/// How a producer claims a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum AccessMode {
    /// Any number of shared producers may attach.
    Shared,
    /// Sole producer on the topic; conflicts fail with `ProducerBusy`.
    Exclusive,
}

/// Identity and dedup state for one attached producer.
///
/// The owning connection is tracked by the transport layer; the topic only
/// holds the name, the access mode and the highest sequence id it has
/// acknowledged, which is what duplicate detection needs.
#[derive(Debug)]
pub struct Producer {
    id: ProducerId,
    name: String,
    access_mode: AccessMode,
    // Highest acknowledged sequence id and the offset it was assigned.
    last_published: Mutex<Option<(u64, Offset)>>,
}

impl Producer {
    pub fn new(name: impl Into<String>, access_mode: AccessMode) -> Self {
        Self {
            id: ProducerId::new(),
            name: name.into(),
            access_mode,
            last_published: Mutex::new(None),
        }
    }

    pub fn id(&self) -> ProducerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn access_mode(&self) -> AccessMode {
        self.access_mode
    }

    /// Offset previously assigned to `sequence_id`, if the id was already
    /// acknowledged. Sequence ids are monotonically increasing per producer,
    /// so anything at or below the high-water mark is a duplicate.
    pub(crate) fn duplicate_of(&self, sequence_id: u64) -> Option<Offset> {
        let last = self.last_published.lock();
        match *last {
            Some((last_sequence, offset)) if sequence_id <= last_sequence => Some(offset),
            _ => None,
        }
    }

    pub(crate) fn record_published(&self, sequence_id: u64, offset: Offset) {
        let mut last = self.last_published.lock();
        if last.is_none_or(|(last_sequence, _)| sequence_id > last_sequence) {
            *last = Some((sequence_id, offset));
        }
    }

    pub fn last_sequence_id(&self) -> Option<u64> {
        self.last_published.lock().map(|(sequence, _)| sequence)
    }
}
