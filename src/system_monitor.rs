//! SystemMonitor (C9, §4.9): abstract connectivity/power-save signal source.
//! The CORE only defines the trait and a default always-on implementation;
//! a real implementation reading OS connectivity APIs is the host's job.

use crate::config::Config;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkType {
    Wifi,
    Cellular,
    Ethernet,
    None,
    Unknown,
}

/// Reports connectivity and power-save state to the rest of the engine.
pub trait SystemMonitor: Send + Sync {
    fn is_connected(&self) -> bool;
    fn network_type(&self) -> NetworkType;
    fn power_save_mode(&self) -> bool;

    /// §4.9: false when not connected, when the connection has no internet
    /// capability, or when cellular sync is disabled and active transport is
    /// cellular.
    fn is_auto_sync_allowed(&self, config: &Config) -> bool {
        if !self.is_connected() {
            return false;
        }
        if self.network_type() == NetworkType::None {
            return false;
        }
        if config.disable_auto_sync_on_cellular && self.network_type() == NetworkType::Cellular {
            return false;
        }
        true
    }
}

/// Default implementation: always connected over wifi, mains-powered.
/// Suitable for tests and headless embeddings with no platform integration.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysConnectedMonitor;

impl SystemMonitor for AlwaysConnectedMonitor {
    fn is_connected(&self) -> bool {
        true
    }

    fn network_type(&self) -> NetworkType {
        NetworkType::Wifi
    }

    fn power_save_mode(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn always_connected_allows_sync_by_default() {
        let monitor = AlwaysConnectedMonitor;
        assert!(monitor.is_auto_sync_allowed(&Config::default()));
    }

    #[test]
    fn cellular_gate_blocks_when_disabled() {
        struct Cellular;
        impl SystemMonitor for Cellular {
            fn is_connected(&self) -> bool {
                true
            }
            fn network_type(&self) -> NetworkType {
                NetworkType::Cellular
            }
            fn power_save_mode(&self) -> bool {
                false
            }
        }
        let config = Config {
            disable_auto_sync_on_cellular: true,
            ..Default::default()
        };
        assert!(!Cellular.is_auto_sync_allowed(&config));
    }

    #[test]
    fn disconnected_blocks_sync() {
        struct Offline;
        impl SystemMonitor for Offline {
            fn is_connected(&self) -> bool {
                false
            }
            fn network_type(&self) -> NetworkType {
                NetworkType::None
            }
            fn power_save_mode(&self) -> bool {
                false
            }
        }
        assert!(!Offline.is_auto_sync_allowed(&Config::default()));
    }
}
