//! Parsers for host enumeration output and device globs.

use camino::{Utf8Path, Utf8PathBuf};
use glob::Pattern;
use regex::Regex;

/// `[host:channel:target:lun]  type  vendor  model ...  /dev/node`
const LSSCSI_LINE: &str = r"^\[(\d+):(\d+):(\d+):(\d+)\]\s+\S+\s+(\S+)\s+(.*?)\s+(/dev/\S+)\s*$";

/// Extracts the IQN from the contents of `/etc/iscsi/initiatorname.iscsi`.
#[must_use]
pub fn parse_initiator_name(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("InitiatorName="))
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
}

/// Finds the device node `lsscsi` lists for `vendor` at host LUN `hlu`.
///
/// The vendor tag may appear in either the vendor or the model column.
#[must_use]
pub fn parse_lsscsi(output: &str, vendor: &str, hlu: u32) -> Option<Utf8PathBuf> {
    let line_pattern = Regex::new(LSSCSI_LINE).ok()?;
    output.lines().find_map(|line| {
        let captures = line_pattern.captures(line.trim())?;
        let lun: u32 = captures.get(4)?.as_str().parse().ok()?;
        let vendor_column = captures.get(5)?.as_str();
        let model_column = captures.get(6)?.as_str();
        let tagged = vendor_column == vendor
            || model_column.split_whitespace().any(|word| word == vendor);
        if !tagged || lun != hlu {
            return None;
        }
        captures
            .get(7)
            .map(|node| Utf8PathBuf::from(node.as_str()))
    })
}

/// Finds the device node `inq -sym_wwn` lists for a Symmetrix device id or
/// WWN.
#[must_use]
pub fn parse_inq_sym_wwn(output: &str, device_id: &str, wwn: Option<&str>) -> Option<Utf8PathBuf> {
    output.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        let [device, _serial, symm_device, symm_wwn] = fields.as_slice() else {
            return None;
        };
        if !device.starts_with("/dev/") {
            return None;
        }
        let by_device = symm_device.eq_ignore_ascii_case(device_id);
        let by_wwn = wwn.is_some_and(|expected| symm_wwn.eq_ignore_ascii_case(expected));
        (by_device || by_wwn).then(|| Utf8PathBuf::from(*device))
    })
}

/// Resolves `<dir>/emc-vol-*<volume_id>*` to its canonical device node.
///
/// Returns `None` when no link exists yet or it cannot be resolved.
#[must_use]
pub fn find_by_id(dir: &Utf8Path, volume_id: &str) -> Option<Utf8PathBuf> {
    let pattern = format!("{dir}/emc-vol-*{}*", Pattern::escape(volume_id));
    let mut matches: Vec<Utf8PathBuf> = glob::glob(&pattern)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|path| Utf8PathBuf::from_path_buf(path).ok())
        .collect();
    matches.sort();
    matches
        .first()
        .and_then(|link| link.canonicalize_utf8().ok())
}
