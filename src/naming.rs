//! Array-side LUN names that embed the cluster and dataset identity.
//!
//! Arrays without a place for caller metadata still let us recover which
//! cluster owns a LUN, and which dataset it holds, from the LUN name alone.
//! Parsing never fails loudly: foreign or malformed names decode to `None`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use uuid::Uuid;

use crate::volume::{BlockDeviceId, ClusterId, DatasetId};

const SEPARATOR: &str = "--";
const COMPACT_MARKER: char = 'f';
const COMPACT_ID_LEN: usize = 22;
const COMPACT_CLUSTER_LEN: usize = 8;

/// Naming convention used by an array family.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NameScheme {
    /// `<prefix>--<short cluster id>--<blockdevice id>`.
    Delimited {
        /// Leading marker identifying volumes we own.
        prefix: &'static str,
    },
    /// `f<base64 dataset uuid><first 8 cluster id chars>`, 31 characters,
    /// for arrays that cap names at 32 characters.
    Compact,
}

/// Encodes and decodes LUN names for one cluster.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LunNaming {
    scheme: NameScheme,
    cluster: ClusterId,
}

impl LunNaming {
    /// Creates a codec for `cluster` using `scheme`.
    #[must_use]
    pub const fn new(scheme: NameScheme, cluster: ClusterId) -> Self {
        Self { scheme, cluster }
    }

    /// Cluster whose names this codec produces.
    #[must_use]
    pub const fn cluster(&self) -> ClusterId {
        self.cluster
    }

    /// Array-side name for the volume holding `dataset`.
    #[must_use]
    pub fn encode(&self, dataset: DatasetId) -> String {
        match self.scheme {
            NameScheme::Delimited { prefix } => format!(
                "{prefix}{SEPARATOR}{}{SEPARATOR}{}",
                self.cluster.short(),
                BlockDeviceId::for_dataset(dataset)
            ),
            NameScheme::Compact => {
                let encoded = STANDARD_NO_PAD
                    .encode(dataset.as_uuid().as_bytes())
                    .replace('/', "_");
                format!(
                    "{COMPACT_MARKER}{encoded}{}",
                    compact_cluster(&self.cluster)
                )
            }
        }
    }

    /// Recovers the dataset from a LUN name owned by this cluster.
    #[must_use]
    pub fn decode(&self, name: &str) -> Option<DatasetId> {
        match self.scheme {
            NameScheme::Delimited { prefix } => self.decode_delimited(prefix, name),
            NameScheme::Compact => self.decode_compact(name),
        }
    }

    /// Returns `true` when `name` belongs to this cluster.
    #[must_use]
    pub fn owns(&self, name: &str) -> bool {
        self.decode(name).is_some()
    }

    fn decode_delimited(&self, prefix: &str, name: &str) -> Option<DatasetId> {
        let mut parts = name.rsplitn(3, SEPARATOR);
        let blockdevice = parts.next()?;
        let cluster = parts.next()?;
        let lead = parts.next()?;
        if lead != prefix {
            return None;
        }
        let short = cluster.split('-').next()?;
        if short != self.cluster.short() {
            return None;
        }
        BlockDeviceId::new(blockdevice).dataset()
    }

    fn decode_compact(&self, name: &str) -> Option<DatasetId> {
        let rest = name.strip_prefix(COMPACT_MARKER)?;
        if !rest.is_ascii() || rest.len() != COMPACT_ID_LEN + COMPACT_CLUSTER_LEN {
            return None;
        }
        let encoded = rest.get(..COMPACT_ID_LEN)?;
        let cluster = rest.get(COMPACT_ID_LEN..)?;
        if cluster != compact_cluster(&self.cluster) {
            return None;
        }
        let bytes = STANDARD_NO_PAD.decode(encoded.replace('_', "/")).ok()?;
        Uuid::from_slice(&bytes).ok().map(DatasetId::new)
    }
}

fn compact_cluster(cluster: &ClusterId) -> String {
    cluster
        .to_string()
        .chars()
        .take(COMPACT_CLUSTER_LEN)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn cluster() -> ClusterId {
        "0c1e6d3a-7f4b-4d2e-9a8c-5b6f7e8d9c0a"
            .parse()
            .unwrap_or_else(|err| panic!("parse cluster: {err}"))
    }

    fn dataset() -> DatasetId {
        "f1d2c3b4-a596-4877-8899-aabbccddeeff"
            .parse()
            .unwrap_or_else(|err| panic!("parse dataset: {err}"))
    }

    #[rstest]
    fn delimited_name_embeds_short_cluster(cluster: ClusterId) {
        let naming = LunNaming::new(NameScheme::Delimited { prefix: "flocker" }, cluster);
        let name = naming.encode(dataset());
        assert_eq!(
            name,
            "flocker--0c1e6d3a--block-f1d2c3b4-a596-4877-8899-aabbccddeeff"
        );
        assert_eq!(naming.decode(&name), Some(dataset()));
    }

    #[rstest]
    #[case("flocker--deadbeef--block-f1d2c3b4-a596-4877-8899-aabbccddeeff")]
    #[case("other--0c1e6d3a--block-f1d2c3b4-a596-4877-8899-aabbccddeeff")]
    #[case("flocker--0c1e6d3a--not-a-blockdevice")]
    #[case("flocker-0c1e6d3a-block")]
    #[case("")]
    #[case("LUN 17")]
    fn delimited_rejects_foreign_names(cluster: ClusterId, #[case] name: &str) {
        let naming = LunNaming::new(NameScheme::Delimited { prefix: "flocker" }, cluster);
        assert_eq!(naming.decode(name), None);
        assert!(!naming.owns(name));
    }

    #[rstest]
    fn compact_name_fits_scaleio_limit(cluster: ClusterId) {
        let naming = LunNaming::new(NameScheme::Compact, cluster);
        let name = naming.encode(dataset());
        assert_eq!(name.len(), 31);
        assert!(name.starts_with('f'));
        assert!(name.ends_with("0c1e6d3a"));
        assert!(!name.contains('/'));
        assert_eq!(naming.decode(&name), Some(dataset()));
    }

    #[rstest]
    fn compact_rejects_other_cluster(cluster: ClusterId) {
        let naming = LunNaming::new(NameScheme::Compact, cluster);
        let name = naming.encode(dataset());
        let other: ClusterId = "11111111-2222-3333-4444-555555555555"
            .parse()
            .unwrap_or_else(|err| panic!("parse cluster: {err}"));
        let foreign = LunNaming::new(NameScheme::Compact, other);
        assert_eq!(foreign.decode(&name), None);
        assert_eq!(naming.decode("fshort"), None);
        assert_eq!(naming.decode("gAAAAAAAAAAAAAAAAAAAAAA0c1e6d3a"), None);
    }
}
