//! Stack-wide configuration (§6), threaded into every constructor that
//! needs one.

use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StackConfig {
    pub mtu: usize,
    pub ip4_default_ttl: u8,
    pub ip6_default_hop: u8,
    pub ip6_frag_flow_timeout: Duration,
    pub tcp_msl: Duration,
    pub tcp_mss_default: u16,
}

impl Default for StackConfig {
    fn default() -> Self {
        StackConfig {
            mtu: 1500,
            ip4_default_ttl: 64,
            ip6_default_hop: 64,
            ip6_frag_flow_timeout: Duration::from_secs(60),
            tcp_msl: Duration::from_secs(120),
            tcp_mss_default: 536,
        }
    }
}

impl StackConfig {
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_ip4_default_ttl(mut self, ttl: u8) -> Self {
        self.ip4_default_ttl = ttl;
        self
    }

    pub fn with_ip6_default_hop(mut self, hop: u8) -> Self {
        self.ip6_default_hop = hop;
        self
    }

    pub fn with_ip6_frag_flow_timeout(mut self, timeout: Duration) -> Self {
        self.ip6_frag_flow_timeout = timeout;
        self
    }

    pub fn with_tcp_msl(mut self, msl: Duration) -> Self {
        self.tcp_msl = msl;
        self
    }

    pub fn with_tcp_mss_default(mut self, mss: u16) -> Self {
        self.tcp_mss_default = mss;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_section_six() {
        let cfg = StackConfig::default();
        assert_eq!(cfg.mtu, 1500);
        assert_eq!(cfg.ip4_default_ttl, 64);
        assert_eq!(cfg.ip6_default_hop, 64);
        assert_eq!(cfg.tcp_msl, Duration::from_secs(120));
        assert_eq!(cfg.tcp_mss_default, 536);
    }

    #[test]
    fn builder_overrides_fields() {
        let cfg = StackConfig::default().with_mtu(9000).with_tcp_mss_default(1460);
        assert_eq!(cfg.mtu, 9000);
        assert_eq!(cfg.tcp_mss_default, 1460);
    }
}
