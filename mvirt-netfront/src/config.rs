//! Front-end configuration and backend feature negotiation

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, StoreError};
use crate::host::{DomainId, Store};
use crate::offload::ReceiveOffload;

/// Upper bound on queues per front-end
pub const MAX_QUEUES: usize = 8;

/// Receive offloads the consumer of received packets can handle
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReceiveOffloadConfig {
    pub tag_manipulation: bool,
    pub ipv4_header_checksum: bool,
    pub ipv4_tcp_checksum: bool,
    pub ipv4_udp_checksum: bool,
    pub ipv6_tcp_checksum: bool,
    pub ipv6_udp_checksum: bool,
    pub ipv4_large_packet: bool,
    pub ipv6_large_packet: bool,
    pub need_checksum_value: bool,
    pub need_large_packet_split: bool,
}

impl Default for ReceiveOffloadConfig {
    fn default() -> Self {
        Self {
            tag_manipulation: true,
            ipv4_header_checksum: true,
            ipv4_tcp_checksum: true,
            ipv4_udp_checksum: true,
            ipv6_tcp_checksum: true,
            ipv6_udp_checksum: true,
            ipv4_large_packet: false,
            ipv6_large_packet: false,
            need_checksum_value: true,
            need_large_packet_split: false,
        }
    }
}

impl ReceiveOffloadConfig {
    pub fn flags(&self) -> ReceiveOffload {
        let mut flags = ReceiveOffload::empty();
        flags.set(ReceiveOffload::TAG_MANIPULATION, self.tag_manipulation);
        flags.set(ReceiveOffload::IPV4_HEADER_CHECKSUM, self.ipv4_header_checksum);
        flags.set(ReceiveOffload::IPV4_TCP_CHECKSUM, self.ipv4_tcp_checksum);
        flags.set(ReceiveOffload::IPV4_UDP_CHECKSUM, self.ipv4_udp_checksum);
        flags.set(ReceiveOffload::IPV6_TCP_CHECKSUM, self.ipv6_tcp_checksum);
        flags.set(ReceiveOffload::IPV6_UDP_CHECKSUM, self.ipv6_udp_checksum);
        flags.set(ReceiveOffload::IPV4_LARGE_PACKET, self.ipv4_large_packet);
        flags.set(ReceiveOffload::IPV6_LARGE_PACKET, self.ipv6_large_packet);
        flags.set(ReceiveOffload::NEED_CHECKSUM_VALUE, self.need_checksum_value);
        flags.set(
            ReceiveOffload::NEED_LARGE_PACKET_SPLIT,
            self.need_large_packet_split,
        );
        flags
    }
}

/// Front-end settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct NetfrontConfig {
    /// Queues requested (capped by what the backend offers)
    pub num_queues: usize,
    /// Domain the backend runs in
    pub backend_domain: DomainId,
    /// Always compute checksums instead of asking the backend to
    pub calculate_checksums: bool,
    /// Never grant caller payload pages, always copy
    pub always_copy: bool,
    pub disable_ipv4_gso: bool,
    pub disable_ipv6_gso: bool,
    pub disable_multicast_control: bool,
    /// Attach hash extra-info slots to transmitted packets
    pub transmit_hash: bool,
    pub receive_offload: ReceiveOffloadConfig,
    pub watchdog_interval_ms: u64,
    /// Overrides the MAC published by the backend
    pub mac: Option<String>,
    /// Receive buffer frames per queue
    pub rx_buffers: usize,
    /// Transmit copy/header frames per queue
    pub tx_buffers: usize,
}

impl Default for NetfrontConfig {
    fn default() -> Self {
        Self {
            num_queues: 1,
            backend_domain: 0,
            calculate_checksums: false,
            always_copy: false,
            disable_ipv4_gso: false,
            disable_ipv6_gso: false,
            disable_multicast_control: false,
            transmit_hash: false,
            receive_offload: ReceiveOffloadConfig::default(),
            watchdog_interval_ms: 4000,
            mac: None,
            rx_buffers: 256,
            tx_buffers: 512,
        }
    }
}

impl NetfrontConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        let config = Self::from_json(&json)?;
        debug!(path = %path.display(), queues = config.num_queues, "Loaded configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_queues == 0 || self.num_queues > MAX_QUEUES {
            return Err(ConfigError::InvalidQueueCount {
                requested: self.num_queues,
                max: MAX_QUEUES,
            });
        }
        self.mac_address()?;
        Ok(())
    }

    /// Parsed `mac`, if configured
    pub fn mac_address(&self) -> Result<Option<[u8; 6]>, ConfigError> {
        self.mac
            .as_deref()
            .map(|mac| parse_mac(mac).ok_or_else(|| ConfigError::InvalidMacAddress(mac.to_string())))
            .transpose()
    }
}

/// Parse MAC address string (e.g., "00:16:3e:12:34:56")
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16).ok()?;
    }
    Some(mac)
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Features advertised by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendFeatures {
    pub sg: bool,
    pub gso_tcpv4: bool,
    pub gso_tcpv6: bool,
    pub no_csum_offload: bool,
    pub ipv6_csum_offload: bool,
    pub multicast_control: bool,
    pub ctrl_ring: bool,
    pub max_queues: usize,
    pub mac: Option<[u8; 6]>,
}

impl Default for BackendFeatures {
    fn default() -> Self {
        Self {
            sg: false,
            gso_tcpv4: false,
            gso_tcpv6: false,
            no_csum_offload: false,
            ipv6_csum_offload: false,
            multicast_control: false,
            ctrl_ring: false,
            max_queues: 1,
            mac: None,
        }
    }
}

fn read_flag(store: &dyn Store, key: &str) -> Result<bool, StoreError> {
    match store.read_backend(key) {
        Ok(value) => match value.trim() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(StoreError::InvalidValue {
                key: key.to_string(),
                value: other.to_string(),
            }),
        },
        Err(StoreError::NotFound(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

impl BackendFeatures {
    /// Read the backend's feature keys; absent keys mean "not supported".
    pub fn read(store: &dyn Store) -> Result<Self, StoreError> {
        let max_queues = match store.read_backend("multi-queue-max-queues") {
            Ok(value) => value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .ok_or_else(|| StoreError::InvalidValue {
                    key: "multi-queue-max-queues".to_string(),
                    value,
                })?,
            Err(StoreError::NotFound(_)) => 1,
            Err(e) => return Err(e),
        };

        let mac = match store.read_backend("mac") {
            Ok(value) => Some(parse_mac(value.trim()).ok_or_else(|| {
                StoreError::InvalidValue {
                    key: "mac".to_string(),
                    value: value.clone(),
                }
            })?),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let features = Self {
            sg: read_flag(store, "feature-sg")?,
            gso_tcpv4: read_flag(store, "feature-gso-tcpv4")?,
            gso_tcpv6: read_flag(store, "feature-gso-tcpv6")?,
            no_csum_offload: read_flag(store, "feature-no-csum-offload")?,
            ipv6_csum_offload: read_flag(store, "feature-ipv6-csum-offload")?,
            multicast_control: read_flag(store, "feature-multicast-control")?,
            ctrl_ring: read_flag(store, "feature-ctrl-ring")?,
            max_queues,
            mac,
        };
        debug!(?features, "Backend features");
        Ok(features)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::test_util::MemoryStore;

    #[test]
    fn test_defaults_from_empty_json() {
        let config = NetfrontConfig::from_json("{}").expect("config");
        assert_eq!(config, NetfrontConfig::default());
        assert_eq!(config.watchdog_interval_ms, 4000);
        assert!(config.receive_offload.flags().contains(
            ReceiveOffload::TAG_MANIPULATION | ReceiveOffload::NEED_CHECKSUM_VALUE
        ));
    }

    #[test]
    fn test_partial_json() {
        let config = NetfrontConfig::from_json(
            r#"{"num_queues": 2, "always_copy": true, "receive_offload": {"ipv4_large_packet": true}}"#,
        )
        .expect("config");
        assert_eq!(config.num_queues, 2);
        assert!(config.always_copy);
        assert!(config.receive_offload.ipv4_large_packet);
        // Unspecified nested fields keep their defaults
        assert!(config.receive_offload.tag_manipulation);
    }

    #[test]
    fn test_invalid_queue_count() {
        let err = NetfrontConfig::from_json(r#"{"num_queues": 0}"#).expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidQueueCount { requested: 0, .. }));
    }

    #[test]
    fn test_invalid_mac() {
        let err = NetfrontConfig::from_json(r#"{"mac": "00:16:3e"}"#).expect_err("invalid");
        assert!(matches!(err, ConfigError::InvalidMacAddress(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, r#"{{"mac": "00:16:3e:01:02:03", "transmit_hash": true}}"#).expect("write");

        let config = NetfrontConfig::from_file(file.path()).expect("config");
        assert!(config.transmit_hash);
        assert_eq!(
            config.mac_address().expect("mac"),
            Some([0x00, 0x16, 0x3e, 0x01, 0x02, 0x03])
        );
    }

    #[test]
    fn test_mac_roundtrip() {
        let mac = [0x00, 0x16, 0x3e, 0xab, 0xcd, 0xef];
        assert_eq!(parse_mac(&format_mac(&mac)), Some(mac));
        assert_eq!(parse_mac("zz:16:3e:ab:cd:ef"), None);
    }

    #[test]
    fn test_backend_features() {
        let store = MemoryStore::new();
        store.set_backend("feature-sg", "1");
        store.set_backend("feature-gso-tcpv4", "1");
        store.set_backend("feature-gso-tcpv6", "0");
        store.set_backend("multi-queue-max-queues", "4");
        store.set_backend("mac", "00:16:3e:00:00:01");

        let features = BackendFeatures::read(&store).expect("features");
        assert!(features.sg);
        assert!(features.gso_tcpv4);
        assert!(!features.gso_tcpv6);
        assert!(!features.multicast_control);
        assert_eq!(features.max_queues, 4);
        assert_eq!(features.mac, Some([0x00, 0x16, 0x3e, 0, 0, 1]));
    }

    #[test]
    fn test_backend_features_bad_flag() {
        let store = MemoryStore::new();
        store.set_backend("feature-sg", "yes");
        let err = BackendFeatures::read(&store).expect_err("invalid");
        assert!(matches!(err, StoreError::InvalidValue { .. }));
    }
}
