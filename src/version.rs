// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
// Version information for the Fabstir GPU Marketplace

/// Semantic version number
pub const VERSION_NUMBER: &str = env!("CARGO_PKG_VERSION");

/// Supported features in this version
pub const FEATURES: &[&str] = &[
    "push-dispatch",
    "pull-preview",
    "reward-priority",
    "retry-promotion",
    "heartbeat-recovery",
    "timeout-recovery",
    "exactly-once-settlement",
    "settlement-backoff",
    "prometheus-metrics",
];

/// Get formatted version string for logging
pub fn get_version_string() -> String {
    format!("Fabstir GPU Marketplace {}", VERSION_NUMBER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_constants() {
        assert!(!VERSION_NUMBER.is_empty());
        assert!(FEATURES.contains(&"exactly-once-settlement"));
        assert!(FEATURES.contains(&"reward-priority"));
    }

    #[test]
    fn test_version_string() {
        assert!(get_version_string().contains(VERSION_NUMBER));
    }
}
