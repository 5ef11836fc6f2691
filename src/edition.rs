//! Edition flag and feature advertisement.
//!
//! The edition is fixed per process. Enterprise gates the device registry
//! endpoints and turns on audit logging; everything else is identical.

use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Edition {
    Community,
    Enterprise,
}

impl Edition {
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("enterprise") {
            Edition::Enterprise
        } else {
            Edition::Community
        }
    }

    pub fn is_enterprise(self) -> bool {
        self == Edition::Enterprise
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Edition::Community => "community",
            Edition::Enterprise => "enterprise",
        }
    }

    /// Feature names advertised by `GET /api/v1/edition`. The deployment
    /// switches that change observable behaviour (placeholder sessions, the
    /// dynamic chunk TTL) are surfaced here so clients can adapt.
    pub fn features(self, placeholder_sessions: bool) -> Vec<&'static str> {
        let mut features = vec!["relay", "handshake", "signaling", "dynamic-chunk-ttl"];
        if placeholder_sessions {
            features.push("placeholder-sessions");
        }
        if self.is_enterprise() {
            features.push("device-registry");
            features.push("audit-log");
        }
        features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults_to_community() {
        assert_eq!(Edition::parse("enterprise"), Edition::Enterprise);
        assert_eq!(Edition::parse("ENTERPRISE"), Edition::Enterprise);
        assert_eq!(Edition::parse("community"), Edition::Community);
        assert_eq!(Edition::parse("anything-else"), Edition::Community);
    }

    #[test]
    fn enterprise_features_superset() {
        let community = Edition::Community.features(false);
        let enterprise = Edition::Enterprise.features(false);
        assert!(community.iter().all(|f| enterprise.contains(f)));
        assert!(enterprise.contains(&"device-registry"));
        assert!(!community.contains(&"audit-log"));
    }

    #[test]
    fn placeholder_feature_flag() {
        assert!(Edition::Community
            .features(true)
            .contains(&"placeholder-sessions"));
        assert!(!Edition::Community
            .features(false)
            .contains(&"placeholder-sessions"));
    }
}
