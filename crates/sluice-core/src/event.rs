//! Replication stream events.
//!
//! Events are created by the source client, transformed into index requests
//! by the request factory, and destroyed once the bulk worker acknowledges
//! the batch that carried them.

use bytes::Bytes;

/// Position of one event within the replication stream: the partition it
/// came from and its sequence number there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventPointer {
    /// Source partition (vbucket) the event belongs to.
    pub partition: u16,
    /// Per-partition monotonic sequence number.
    pub seqno: u64,
}

impl EventPointer {
    /// Creates a pointer.
    #[must_use]
    pub fn new(partition: u16, seqno: u64) -> Self {
        Self { partition, seqno }
    }
}

/// A single event from the source's replication stream.
#[derive(Debug, Clone)]
pub enum ReplicationEvent {
    /// A document was created or updated.
    Mutation {
        /// Document key.
        key: String,
        /// Compare-and-swap value of the mutation.
        cas: u64,
        /// Revision sequence number; used as the index document version.
        rev_seqno: u64,
        /// Source partition.
        partition: u16,
        /// Per-partition sequence number.
        seqno: u64,
        /// Raw document body.
        body: Bytes,
        /// Raw extended attributes, when the stream carries them.
        xattrs: Option<Bytes>,
    },

    /// A document was removed (deletion or expiry).
    Deletion {
        /// Document key.
        key: String,
        /// Compare-and-swap value of the deletion.
        cas: u64,
        /// Revision sequence number; used as the index document version.
        rev_seqno: u64,
        /// Source partition.
        partition: u16,
        /// Per-partition sequence number.
        seqno: u64,
    },

    /// Seqnos `start..=end` of a partition form an atomic snapshot.
    /// Checkpoints record the enclosing marker so streams resume correctly.
    SnapshotMarker {
        /// Source partition.
        partition: u16,
        /// First seqno of the snapshot.
        start: u64,
        /// Last seqno of the snapshot.
        end: u64,
    },
}

impl ReplicationEvent {
    /// The partition this event belongs to.
    #[must_use]
    pub fn partition(&self) -> u16 {
        match self {
            Self::Mutation { partition, .. }
            | Self::Deletion { partition, .. }
            | Self::SnapshotMarker { partition, .. } => *partition,
        }
    }

    /// The stream position of a document event. Snapshot markers have no
    /// position of their own.
    #[must_use]
    pub fn pointer(&self) -> Option<EventPointer> {
        match self {
            Self::Mutation {
                partition, seqno, ..
            }
            | Self::Deletion {
                partition, seqno, ..
            } => Some(EventPointer::new(*partition, *seqno)),
            Self::SnapshotMarker { .. } => None,
        }
    }

    /// The document key, for mutation and deletion events.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Mutation { key, .. } | Self::Deletion { key, .. } => Some(key),
            Self::SnapshotMarker { .. } => None,
        }
    }
}
