//! Per-family constants shared by the orchestrator and the connector.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::naming::NameScheme;

const MIB: u64 = 1 << 20;
const GIB: u64 = 1 << 30;
const VMAX_CYLINDER: u64 = 1920 * 1024;

/// Array product line served by a client.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArrayFamily {
    /// XtremIO all-flash array managed through XMS.
    XtremIo,
    /// VNX unified storage managed through `naviseccli`.
    Vnx,
    /// Unity managed through Unisphere REST.
    Unity,
    /// VMAX managed through Unisphere for VMAX REST.
    Vmax,
    /// ScaleIO software-defined storage managed through its gateway.
    ScaleIo,
}

impl ArrayFamily {
    /// All supported families, in configuration order.
    pub const ALL: [Self; 5] = [
        Self::XtremIo,
        Self::Vnx,
        Self::Unity,
        Self::Vmax,
        Self::ScaleIo,
    ];

    /// Sizing granularity in bytes.
    ///
    /// VMAX allocates on cylinder boundaries with a 1 GiB floor, so its unit
    /// is 1 GiB rounded up to the next 1920 KiB cylinder.
    #[must_use]
    pub const fn allocation_unit(self) -> u64 {
        match self {
            Self::XtremIo => MIB,
            Self::Vnx | Self::Unity => GIB,
            Self::ScaleIo => 8 * GIB,
            Self::Vmax => GIB.next_multiple_of(VMAX_CYLINDER),
        }
    }

    /// Naming convention for array-side LUN names.
    #[must_use]
    pub const fn name_scheme(self) -> NameScheme {
        match self {
            Self::XtremIo | Self::Vnx | Self::Unity => NameScheme::Delimited { prefix: "flocker" },
            Self::Vmax => NameScheme::Delimited { prefix: "FLOCKER" },
            Self::ScaleIo => NameScheme::Compact,
        }
    }

    /// Whether volume identity lives in the metadata store.
    #[must_use]
    pub const fn requires_metadata(self) -> bool {
        matches!(self, Self::Vmax | Self::ScaleIo)
    }

    /// Vendor or model tag reported by `lsscsi` for this family's LUNs.
    #[must_use]
    pub const fn scsi_vendor(self) -> Option<&'static str> {
        match self {
            Self::XtremIo => Some("XtremApp"),
            Self::Vnx | Self::Unity => Some("DGC"),
            Self::Vmax => Some("EMC"),
            Self::ScaleIo => None,
        }
    }

    /// Lowercase configuration keyword.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::XtremIo => "xtremio",
            Self::Vnx => "vnx",
            Self::Unity => "unity",
            Self::Vmax => "vmax",
            Self::ScaleIo => "scaleio",
        }
    }
}

impl fmt::Display for ArrayFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raised when a backend keyword is not recognised.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("unknown backend '{0}' (expected one of xtremio, vnx, unity, vmax, scaleio)")]
pub struct UnknownFamily(pub String);

impl FromStr for ArrayFamily {
    type Err = UnknownFamily;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let wanted = value.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|family| family.as_str() == wanted)
            .ok_or_else(|| UnknownFamily(value.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn vmax_unit_is_cylinder_aligned_gib() {
        let unit = ArrayFamily::Vmax.allocation_unit();
        assert_eq!(unit, 1_075_445_760);
        assert_eq!(unit % VMAX_CYLINDER, 0);
        assert!(unit >= GIB);
    }

    #[rstest]
    #[case("VNX", ArrayFamily::Vnx)]
    #[case(" scaleio ", ArrayFamily::ScaleIo)]
    #[case("XtremIO", ArrayFamily::XtremIo)]
    fn parses_backend_keywords(#[case] raw: &str, #[case] expected: ArrayFamily) {
        assert_eq!(raw.parse::<ArrayFamily>(), Ok(expected));
    }

    #[test]
    fn rejects_unknown_backend() {
        let err = "netapp"
            .parse::<ArrayFamily>()
            .expect_err("netapp is not supported");
        assert!(err.to_string().contains("netapp"), "message: {err}");
    }

    #[test]
    fn only_vmax_and_scaleio_need_metadata() {
        let tracked: Vec<_> = ArrayFamily::ALL
            .into_iter()
            .filter(|family| family.requires_metadata())
            .collect();
        assert_eq!(tracked, vec![ArrayFamily::Vmax, ArrayFamily::ScaleIo]);
    }
}
