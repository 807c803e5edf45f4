//! Framework-independent planning of the devices a VM gets.

use burrow_core::{Error, NetworkConfig, NetworkMode, Result, SharedDir};
use std::collections::BTreeMap;
use std::path::Path;

/// virtio-fs tags are limited to 36 bytes.
const MAX_TAG_LEN: usize = 36;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MacChoice {
    /// Canonical `aa:bb:cc:dd:ee:ff` form.
    Static(String),
    RandomLocal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharePlan {
    pub tag: String,
    pub host_path: String,
    pub read_only: bool,
}

pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut parts = s.split([':', '-']);
    for byte in bytes.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(bytes)
}

pub fn format_mac(bytes: [u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// The MAC the network device should use. Unparseable addresses fall back
/// to a random locally-administered one.
pub fn mac_choice(network: &NetworkConfig) -> MacChoice {
    match network.mac_address.as_deref().filter(|s| !s.is_empty()) {
        None => MacChoice::RandomLocal,
        Some(raw) => match parse_mac(raw) {
            Some(bytes) => MacChoice::Static(format_mac(bytes)),
            None => {
                tracing::warn!("Ignoring invalid MAC address {:?}; using a random one", raw);
                MacChoice::RandomLocal
            }
        },
    }
}

/// Returns the MAC plan when networking is enabled. Bridged mode attaches NAT.
pub fn network_plan(network: &NetworkConfig) -> Result<Option<MacChoice>> {
    if !network.enabled {
        return Ok(None);
    }
    if network.mode()? == NetworkMode::Bridged {
        tracing::warn!(
            "Bridged networking requires the com.apple.vm.networking entitlement; attaching NAT instead"
        );
    }
    Ok(Some(mac_choice(network)))
}

pub fn path_str<'a>(path: &'a Path, what: &str) -> Result<&'a str> {
    path.to_str().ok_or_else(|| {
        Error::InvalidConfig(format!("{} path is not UTF-8: {}", what, path.display()))
    })
}

/// One virtio-fs device per tag, in tag order.
pub fn share_plans(dirs: &BTreeMap<String, SharedDir>) -> Result<Vec<SharePlan>> {
    dirs.iter()
        .map(|(tag, dir)| {
            if tag.is_empty() || tag.len() > MAX_TAG_LEN {
                return Err(Error::InvalidConfig(format!(
                    "mount tag {:?} must be 1 to {} bytes",
                    tag, MAX_TAG_LEN
                )));
            }
            Ok(SharePlan {
                tag: tag.clone(),
                host_path: path_str(&dir.host_path, "shared directory")?.to_string(),
                read_only: dir.read_only,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_colon_and_dash_separated_macs() {
        assert_eq!(
            parse_mac("52:54:00:AB:cd:01"),
            Some([0x52, 0x54, 0x00, 0xab, 0xcd, 0x01])
        );
        assert_eq!(
            parse_mac("52-54-00-ab-cd-01"),
            Some([0x52, 0x54, 0x00, 0xab, 0xcd, 0x01])
        );
    }

    #[test]
    fn rejects_malformed_macs() {
        for bad in ["", "52:54:00:ab:cd", "52:54:00:ab:cd:01:02", "5:54:00:ab:cd:01", "zz:54:00:ab:cd:01"] {
            assert_eq!(parse_mac(bad), None, "{}", bad);
        }
    }

    #[test]
    fn mac_choice_normalizes_or_falls_back() {
        let mut network = NetworkConfig::nat();
        assert_eq!(mac_choice(&network), MacChoice::RandomLocal);

        network.mac_address = Some("52-54-00-AB-CD-01".to_string());
        assert_eq!(
            mac_choice(&network),
            MacChoice::Static("52:54:00:ab:cd:01".to_string())
        );

        network.mac_address = Some("not-a-mac".to_string());
        assert_eq!(mac_choice(&network), MacChoice::RandomLocal);
    }

    #[test]
    fn disabled_network_has_no_device() {
        assert_eq!(network_plan(&NetworkConfig::default()).unwrap(), None);
    }

    #[test]
    fn bridged_and_empty_modes_attach_nat() {
        let mut network = NetworkConfig::nat();
        network.mode = "bridged".to_string();
        assert_eq!(network_plan(&network).unwrap(), Some(MacChoice::RandomLocal));

        network.mode = String::new();
        assert!(network_plan(&network).unwrap().is_some());

        network.mode = "host-only".to_string();
        assert!(matches!(network_plan(&network), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn shares_follow_tag_order() {
        let mut dirs = BTreeMap::new();
        dirs.insert("src".to_string(), SharedDir::new("/Users/me/src", false));
        dirs.insert("data".to_string(), SharedDir::new("/Volumes/data", true));

        let plans = share_plans(&dirs).unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].tag, "data");
        assert!(plans[0].read_only);
        assert_eq!(plans[1].host_path, "/Users/me/src");
    }

    #[test]
    fn overlong_tag_is_rejected() {
        let mut dirs = BTreeMap::new();
        dirs.insert("t".repeat(37), SharedDir::new("/tmp", false));
        assert!(matches!(share_plans(&dirs), Err(Error::InvalidConfig(_))));
    }
}
