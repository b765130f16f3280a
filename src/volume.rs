//! Volume identifiers, the generic volume descriptor, and size rounding.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::array::ArrayFamily;

const BLOCKDEVICE_PREFIX: &str = "block-";

/// Identifier of the orchestrator cluster that owns a set of volumes.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct ClusterId(Uuid);

impl ClusterId {
    /// Wraps a cluster UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// First hyphen-separated segment of the UUID (eight hex characters).
    ///
    /// Array names are length limited, so only this prefix is embedded.
    #[must_use]
    pub fn short(&self) -> String {
        let hyphenated = self.0.hyphenated().to_string();
        hyphenated
            .split('-')
            .next()
            .map_or_else(String::new, str::to_owned)
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ClusterId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

/// Caller-supplied logical dataset identifier.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct DatasetId(Uuid);

impl DatasetId {
    /// Wraps a dataset UUID.
    #[must_use]
    pub const fn new(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetId {
    type Err = uuid::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(value.trim()).map(Self)
    }
}

/// Stable identifier the volume framework uses to address a volume.
///
/// Name-derived families use `block-<dataset id>`; metadata families use the
/// UUID of the metadata record.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct BlockDeviceId(String);

impl BlockDeviceId {
    /// Wraps an identifier string without validation.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Derives the identifier of a name-encoded volume from its dataset.
    #[must_use]
    pub fn for_dataset(dataset: DatasetId) -> Self {
        Self(format!("{BLOCKDEVICE_PREFIX}{dataset}"))
    }

    /// Identifier of a metadata-tracked volume.
    #[must_use]
    pub fn for_record(record_id: Uuid) -> Self {
        Self(record_id.to_string())
    }

    /// Recovers the dataset encoded in a `block-<uuid>` identifier.
    #[must_use]
    pub fn dataset(&self) -> Option<DatasetId> {
        self.0
            .strip_prefix(BLOCKDEVICE_PREFIX)
            .and_then(|rest| rest.parse().ok())
    }

    /// Parses the identifier as a metadata record UUID.
    #[must_use]
    pub fn record_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.0).ok()
    }

    /// Borrows the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlockDeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Vendor key bundle locating a volume on its array.
///
/// The orchestrator never interprets the contents; only the vendor client does.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ArrayHandle {
    /// Array family that issued the handle.
    pub family: ArrayFamily,
    /// Array-assigned LUN identifier.
    pub lun_id: String,
    /// Array-side LUN name.
    pub lun_name: String,
    /// Additional vendor keys, such as VMAX keybindings.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keys: BTreeMap<String, String>,
}

/// Generic volume descriptor returned by every verb.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Volume {
    /// Identifier used by the volume framework.
    pub blockdevice_id: BlockDeviceId,
    /// Dataset stored on the volume.
    pub dataset_id: DatasetId,
    /// Provisioned size, a multiple of the backend allocation unit.
    pub size_bytes: u64,
    /// Compute instance the volume is mapped to, if any.
    pub attached_to: Option<String>,
    /// Cluster namespace the volume belongs to.
    pub cluster_id: ClusterId,
    /// Vendor key bundle.
    pub array_handle: ArrayHandle,
}

impl Volume {
    /// Returns a copy with the attachment replaced.
    #[must_use]
    pub fn with_attached_to(mut self, host: Option<String>) -> Self {
        self.attached_to = host;
        self
    }
}

/// Rounds `size` up to the next multiple of `unit`, never below one unit.
///
/// Returns `None` when `unit` is zero or the result does not fit in `u64`.
#[must_use]
pub const fn round_up(size: u64, unit: u64) -> Option<u64> {
    if unit == 0 {
        return None;
    }
    if size == 0 {
        return Some(unit);
    }
    size.checked_next_multiple_of(unit)
}
