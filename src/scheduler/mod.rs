//! Storage pool selection.
//!
//! Candidates are first restricted to the pools this host manages, then
//! optionally to the pools carrying a service profile, and finally the pool
//! with the most free capacity that still fits the request wins.

use std::fmt;
use std::str::FromStr;

use glob::Pattern;
use tracing::{debug, warn};

use crate::array::StoragePool;
use crate::error::BlockDeviceError;

/// Service level requested for a new volume.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Profile {
    /// Capacity tier.
    Bronze,
    /// Balanced tier.
    Silver,
    /// Performance tier.
    Gold,
}

impl Profile {
    /// Capability usage tag the array attaches to pools of this tier.
    #[must_use]
    pub const fn usage_tag(self) -> &'static str {
        match self {
            Self::Bronze => "flocker_bronze",
            Self::Silver => "flocker_silver",
            Self::Gold => "flocker_gold",
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bronze => f.write_str("BRONZE"),
            Self::Silver => f.write_str("SILVER"),
            Self::Gold => f.write_str("GOLD"),
        }
    }
}

impl FromStr for Profile {
    type Err = BlockDeviceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BRONZE" => Ok(Self::Bronze),
            "SILVER" => Ok(Self::Silver),
            "GOLD" => Ok(Self::Gold),
            _ => Err(BlockDeviceError::configuration(
                value,
                "unknown profile (expected BRONZE, SILVER or GOLD)",
            )),
        }
    }
}

/// Profile restriction resolved against the array.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProfileFilter {
    /// Requested profile.
    pub profile: Profile,
    /// Identifiers of pools carrying the profile's usage tag.
    pub pool_ids: Vec<String>,
}

/// What a new volume needs from its pool.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PlacementRequest {
    /// Rounded size in bytes.
    pub size_bytes: u64,
    /// Optional profile restriction.
    pub profile: Option<ProfileFilter>,
}

/// Strategy choosing one pool for a new volume.
pub trait PoolScheduler: Send + Sync {
    /// Whether the orchestrator should resolve profile pools before calling
    /// [`PoolScheduler::select`].
    fn honours_profiles(&self) -> bool;

    /// Picks a pool from `pools`.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::CapacityExhausted`] when nothing fits.
    fn select<'p>(
        &self,
        pools: &'p [StoragePool],
        request: &PlacementRequest,
    ) -> Result<&'p StoragePool, BlockDeviceError>;
}

/// Chooses the pool with the most free capacity, ignoring profiles.
#[derive(Clone, Copy, Debug, Default)]
pub struct CapacityScheduler;

impl PoolScheduler for CapacityScheduler {
    fn honours_profiles(&self) -> bool {
        false
    }

    fn select<'p>(
        &self,
        pools: &'p [StoragePool],
        request: &PlacementRequest,
    ) -> Result<&'p StoragePool, BlockDeviceError> {
        if let Some(filter) = &request.profile {
            debug!(profile = %filter.profile, "capacity scheduler ignores profiles");
        }
        largest_fit(pools.iter(), request.size_bytes).ok_or_else(|| exhausted(pools, request))
    }
}

/// Narrows candidates to the requested profile, then chooses by capacity.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProfileScheduler;

impl PoolScheduler for ProfileScheduler {
    fn honours_profiles(&self) -> bool {
        true
    }

    fn select<'p>(
        &self,
        pools: &'p [StoragePool],
        request: &PlacementRequest,
    ) -> Result<&'p StoragePool, BlockDeviceError> {
        let selected = match &request.profile {
            Some(filter) => largest_fit(
                pools
                    .iter()
                    .filter(|pool| filter.pool_ids.iter().any(|id| *id == pool.id)),
                request.size_bytes,
            ),
            None => largest_fit(pools.iter(), request.size_bytes),
        };
        selected.ok_or_else(|| exhausted(pools, request))
    }
}

/// Greedy choice: most free capacity among pools that fit; ties keep the
/// first candidate.
fn largest_fit<'p>(
    pools: impl Iterator<Item = &'p StoragePool>,
    size_bytes: u64,
) -> Option<&'p StoragePool> {
    let mut selected: Option<&StoragePool> = None;
    for pool in pools {
        if pool.free_bytes < size_bytes {
            continue;
        }
        if selected.is_none_or(|best| pool.free_bytes > best.free_bytes) {
            selected = Some(pool);
        }
    }
    selected
}

fn exhausted(pools: &[StoragePool], request: &PlacementRequest) -> BlockDeviceError {
    let names = pools
        .iter()
        .map(|pool| format!("{}({} free)", pool.name, pool.free_bytes))
        .collect::<Vec<_>>()
        .join(",");
    let pools = match &request.profile {
        Some(filter) => format!("{names}; profile {}", filter.profile),
        None => names,
    };
    BlockDeviceError::CapacityExhausted {
        size_bytes: request.size_bytes,
        pools,
    }
}

/// Pools this host is allowed to provision from, as glob patterns.
#[derive(Clone, Debug, Default)]
pub struct ManagedPools {
    patterns: Vec<Pattern>,
}

impl ManagedPools {
    /// Parses a comma-separated list of case-sensitive glob patterns. An
    /// absent or blank list manages every pool.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::ConfigurationError`] for an invalid pattern.
    pub fn parse(list: Option<&str>) -> Result<Self, BlockDeviceError> {
        let patterns = list
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|raw| !raw.is_empty())
            .map(|raw| {
                Pattern::new(raw).map_err(|err| {
                    BlockDeviceError::configuration(raw, format!("invalid pool pattern: {err}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// Keeps only the pools matching at least one pattern.
    ///
    /// # Errors
    ///
    /// Returns [`BlockDeviceError::ConfigurationError`] when patterns were
    /// given but none of them matches an existing pool.
    pub fn filter(&self, pools: Vec<StoragePool>) -> Result<Vec<StoragePool>, BlockDeviceError> {
        if self.patterns.is_empty() {
            debug!("no storage pools configured, managing every pool");
            return Ok(pools);
        }

        let (matched, unmatched): (Vec<_>, Vec<_>) = pools
            .into_iter()
            .partition(|pool| self.patterns.iter().any(|pattern| pattern.matches(&pool.name)));

        if matched.is_empty() {
            let available = unmatched
                .iter()
                .map(|pool| pool.name.as_str())
                .collect::<Vec<_>>()
                .join(",");
            return Err(BlockDeviceError::configuration(
                self.describe(),
                format!("no configured storage pool exists; available pools: {available}"),
            ));
        }

        if !unmatched.is_empty() {
            warn!(
                skipped = %unmatched.iter().map(|pool| pool.name.as_str()).collect::<Vec<_>>().join(","),
                managed = %matched.iter().map(|pool| pool.name.as_str()).collect::<Vec<_>>().join(","),
                "some storage pools are not managed by this host"
            );
        }
        Ok(matched)
    }

    fn describe(&self) -> String {
        self.patterns
            .iter()
            .map(Pattern::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}
