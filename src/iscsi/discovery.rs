//! Parsers for open-iscsi command output

use crate::domain::{DiscoveredTarget, IscsiSession, Portal};

/// Parse a `portal,tpgt` token as printed by iscsiadm
fn parse_portal(token: &str) -> Option<Portal> {
    let address = token.split(',').next()?;
    address.parse().ok()
}

/// Lazily parse `iscsiadm -m discovery -t st` output
///
/// Each useful line reads `10.10.1.5:3260,1 iqn.2002-03.com.compellent:...`;
/// anything else is skipped.
pub fn parse_discovery(output: &str) -> impl Iterator<Item = DiscoveredTarget> + '_ {
    output.lines().filter_map(|line| {
        let mut tokens = line.split_whitespace();
        let portal = parse_portal(tokens.next()?)?;
        let iqn = tokens.next()?;
        iqn.starts_with("iqn.")
            .then(|| DiscoveredTarget {
                portal,
                iqn: iqn.to_string(),
            })
    })
}

/// Parse `iscsiadm -m session` output
///
/// Lines read `tcp: [3] 10.10.1.5:3260,1 iqn.2002-03.com.compellent:... (non-flash)`.
pub fn parse_sessions(output: &str) -> Vec<IscsiSession> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace().skip_while(|t| !t.starts_with('['));
            tokens.next()?;
            let portal = parse_portal(tokens.next()?)?;
            let target_iqn = tokens.next()?.to_string();
            Some(IscsiSession { target_iqn, portal })
        })
        .collect()
}

/// Extract the `InitiatorName=` value from initiatorname.iscsi
pub fn parse_initiator_name(contents: &str) -> Option<String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .find_map(|line| line.strip_prefix("InitiatorName="))
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
}

/// Whole-disk SCSI nodes only: `sda`, `sdab`, never `sda1`
pub fn is_whole_disk(name: &str) -> bool {
    name.strip_prefix("sd")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_lowercase()))
}
