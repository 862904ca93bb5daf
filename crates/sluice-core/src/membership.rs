//! Group membership and deterministic partition ownership.
//!
//! A replication group is a fixed-size set of peer processes. Each peer
//! knows only its own member number and the group size; partition ownership
//! is a pure function of the two, so peers never coordinate at runtime.
//! Member `m` of `n` owns exactly the partitions `p` where
//! `p mod n == m - 1`, which makes the per-member partition sets pairwise
//! disjoint and jointly exhaustive.

use std::fmt;

use crate::error::ConfigError;

/// Largest supported replication group.
pub const MAX_CLUSTER_SIZE: u16 = 1024;

/// Identity of one member within a replication group of fixed size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Membership {
    member_number: u16,
    cluster_size: u16,
}

impl Membership {
    /// Creates a validated membership: `1 <= member_number <= cluster_size`
    /// and `cluster_size <= 1024`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Membership` when either bound is violated.
    pub fn of(member_number: u16, cluster_size: u16) -> Result<Self, ConfigError> {
        if cluster_size == 0 || cluster_size > MAX_CLUSTER_SIZE {
            return Err(ConfigError::Membership(format!(
                "totalMembers must be between 1 and {MAX_CLUSTER_SIZE} (got {cluster_size}). \
                 Did you forget to set the CBES_TOTAL_MEMBERS environment variable?"
            )));
        }
        if member_number == 0 || member_number > cluster_size {
            return Err(ConfigError::Membership(format!(
                "memberNumber must be between 1 and {cluster_size} (got {member_number})"
            )));
        }
        Ok(Self {
            member_number,
            cluster_size,
        })
    }

    /// One-based number of this member within the group.
    #[must_use]
    pub fn member_number(&self) -> u16 {
        self.member_number
    }

    /// Total number of members in the group.
    #[must_use]
    pub fn cluster_size(&self) -> u16 {
        self.cluster_size
    }

    /// Whether this member owns the given partition.
    #[must_use]
    pub fn owns(&self, partition: u16) -> bool {
        partition % self.cluster_size == self.member_number - 1
    }

    /// The sorted set of partitions this member owns, out of
    /// `num_partitions` total.
    ///
    /// An empty result means there are more workers than partitions; the
    /// caller must treat that as fatal, since a worker with nothing to do
    /// would otherwise sit idle while claiming group membership.
    #[must_use]
    pub fn partitions(&self, num_partitions: u16) -> Vec<u16> {
        (0..num_partitions).filter(|p| self.owns(*p)).collect()
    }
}

impl fmt::Display for Membership {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {}", self.member_number, self.cluster_size)
    }
}
