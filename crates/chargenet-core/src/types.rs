//! Core types for the chargenet protocol
//!
//! This module defines the identifiers used throughout the substrate, using newtype
//! patterns for validation and type safety: node identities, the hop chain a message
//! traversed, request identifiers and wall-clock timestamps.

use core::fmt;
use core::ops::{Add, Deref, Sub};
use core::str::FromStr;
use core::sync::atomic::{AtomicU64, Ordering};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::errors::FormationError;

/// Maximum length of a node or request identifier in bytes
pub const MAX_IDENTIFIER_LENGTH: usize = 255;

fn validate_identifier(field: &'static str, value: &str) -> Result<(), FormationError> {
    if value.is_empty() {
        return Err(FormationError::invalid_field(field, "must not be empty"));
    }
    if value.len() > MAX_IDENTIFIER_LENGTH {
        return Err(FormationError::invalid_field(
            field,
            format!("longer than {} bytes", MAX_IDENTIFIER_LENGTH),
        ));
    }
    if value.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(FormationError::invalid_field(
            field,
            "contains whitespace or control characters",
        ));
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// Node Identifier
// ----------------------------------------------------------------------------

/// Unique identifier of a protocol participant (charging station, local controller,
/// networking node or management system)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a validated node id
    pub fn new<T: Into<String>>(value: T) -> Result<Self, FormationError> {
        let value = value.into();
        validate_identifier("nodeId", &value)?;
        Ok(Self(value))
    }

    /// Get the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = FormationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = FormationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl Deref for NodeId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Network Path
// ----------------------------------------------------------------------------

/// Ordered, append-only list of hops a message passed through
///
/// The first hop is the originator, the last hop the most recent relay. An empty
/// path means direct delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkPath(SmallVec<[NodeId; 4]>);

impl NetworkPath {
    /// Empty path (direct delivery)
    pub fn empty() -> Self {
        Self(SmallVec::new())
    }

    /// Path starting at the given originator
    pub fn from_origin(origin: NodeId) -> Self {
        let mut hops = SmallVec::new();
        hops.push(origin);
        Self(hops)
    }

    /// Build a path from an ordered hop list
    pub fn from_hops<I: IntoIterator<Item = NodeId>>(hops: I) -> Self {
        Self(hops.into_iter().collect())
    }

    /// Return a new path with `hop` appended
    pub fn append(&self, hop: NodeId) -> Self {
        let mut hops = self.0.clone();
        hops.push(hop);
        Self(hops)
    }

    /// Check whether a node already appears in the path
    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.iter().any(|hop| hop == node)
    }

    /// The node that originated the message, if recorded
    pub fn origin(&self) -> Option<&NodeId> {
        self.0.first()
    }

    /// The most recent hop
    pub fn last_hop(&self) -> Option<&NodeId> {
        self.0.last()
    }

    /// Path in reply order (most recent hop first)
    pub fn reversed(&self) -> Self {
        Self(self.0.iter().rev().cloned().collect())
    }

    /// A path is looping when any hop occurs more than once
    pub fn has_loop(&self) -> bool {
        self.0
            .iter()
            .enumerate()
            .any(|(i, hop)| self.0[i + 1..].contains(hop))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.0.iter()
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for hop in &self.0 {
            if !first {
                f.write_str(" -> ")?;
            }
            f.write_str(hop.as_str())?;
            first = false;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// Request Identifier
// ----------------------------------------------------------------------------

/// Identifier correlating a request with its response or error
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RequestId(String);

impl RequestId {
    /// Create a validated request id
    pub fn new<T: Into<String>>(value: T) -> Result<Self, FormationError> {
        let value = value.into();
        validate_identifier("requestId", &value)?;
        Ok(Self(value))
    }

    /// Generate a random (UUID v4) request id
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty id standing in for the hop-scoped one in signing input
    pub(crate) fn blank() -> Self {
        Self(String::new())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RequestId {
    type Err = FormationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for RequestId {
    type Error = FormationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RequestId> for String {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

/// Monotonic request id source scoped to one connection direction
#[derive(Debug)]
pub struct RequestIdGenerator {
    prefix: String,
    next: AtomicU64,
}

impl RequestIdGenerator {
    /// Ids look like `<prefix>-<counter>`
    pub fn new<T: Into<String>>(prefix: T) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }

    /// Allocate the next id
    pub fn next_id(&self) -> RequestId {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        RequestId(format!("{}-{}", self.prefix, n))
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Millisecond timestamp since Unix epoch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Add<u64> for Timestamp {
    type Output = Timestamp;

    fn add(self, other: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(other))
    }
}

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
