//! Brokerage account descriptors.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Broker platform the account lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Mt4,
    Mt5,
    CTrader,
}

/// Account classification, mostly relevant for prop-firm limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccountType {
    Live,
    Demo,
    PropEvaluation,
    PropFunded,
}

impl AccountType {
    /// Prop-firm accounts carry externally enforced loss rules.
    pub fn is_prop(&self) -> bool {
        matches!(self, AccountType::PropEvaluation | AccountType::PropFunded)
    }
}

/// A brokerage account known to the router. Immutable after config load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDescriptor {
    /// Opaque stable identifier used in pool API calls.
    pub id: String,
    pub nickname: String,
    pub platform: Platform,
    /// Pool region hosting the account connection.
    pub region: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    #[serde(default)]
    pub initial_balance: Decimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_type_prop_detection() {
        assert!(AccountType::PropEvaluation.is_prop());
        assert!(AccountType::PropFunded.is_prop());
        assert!(!AccountType::Live.is_prop());
        assert!(!AccountType::Demo.is_prop());
    }

    #[test]
    fn test_account_descriptor_parses_camel_case() {
        let json = r#"{
            "id": "acct-1",
            "nickname": "Main",
            "platform": "mt5",
            "region": "london",
            "type": "prop-funded",
            "initialBalance": "100000"
        }"#;
        let acct: AccountDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(acct.account_type, AccountType::PropFunded);
        assert_eq!(acct.region, "london");
    }
}
