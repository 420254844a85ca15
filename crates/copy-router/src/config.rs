//! Routing configuration: accounts × rule sets × routes.
//!
//! The whole file parses into typed structures up front; unknown
//! fields are ignored, unknown *references* (accounts, rule sets,
//! filter names) fail validation with an error naming the offender.

use chrono::{NaiveTime, Weekday};
use copy_core::types::{
    AccountDescriptor, AccountType, DynamicTier, NotificationFlags, Platform, Route, RuleSet,
    SizingMode,
};
use copy_core::{Error, Result};
use copy_engine::filters::{is_known_filter, FilterParams};
use risk_monitor::{AlertSettings, EmergencyStopConfig, PerfMonitorConfig};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    pub accounts: HashMap<String, AccountConfig>,
    pub rule_sets: HashMap<String, RuleSetConfig>,
    #[serde(default)]
    pub filters: HashMap<String, FilterParams>,
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub global_settings: GlobalSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub nickname: String,
    pub platform: Platform,
    pub region: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    #[serde(default)]
    pub initial_balance: Decimal,
}

impl AccountConfig {
    pub fn descriptor(&self, id: &str) -> AccountDescriptor {
        AccountDescriptor {
            id: id.to_string(),
            nickname: self.nickname.clone(),
            platform: self.platform,
            region: self.region.clone(),
            account_type: self.account_type,
            initial_balance: self.initial_balance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizingType {
    Proportional,
    Fixed,
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSetConfig {
    #[serde(rename = "type")]
    pub sizing_type: SizingType,
    pub multiplier: Option<Decimal>,
    pub fixed_lot_size: Option<Decimal>,
    pub dynamic: Option<Vec<DynamicTier>>,
    pub max_daily_trades: u32,
    pub max_daily_loss: Decimal,
    /// Milliseconds between copies on the same route.
    #[serde(default)]
    pub min_time_between_trades: i64,
    pub max_open_positions: usize,
    #[serde(default = "default_max_cycles")]
    pub max_concurrent_cycles: usize,
    #[serde(default)]
    pub filters: Vec<String>,
}

fn default_max_cycles() -> usize {
    3
}

impl RuleSetConfig {
    pub fn to_rule_set(&self, name: &str) -> Result<RuleSet> {
        let sizing = match self.sizing_type {
            SizingType::Proportional => {
                let multiplier = self.multiplier.ok_or_else(|| {
                    Error::Config(format!("rule set '{name}': proportional sizing needs a multiplier"))
                })?;
                SizingMode::Proportional { multiplier }
            }
            SizingType::Fixed => {
                let lots = self.fixed_lot_size.ok_or_else(|| {
                    Error::Config(format!("rule set '{name}': fixed sizing needs fixedLotSize"))
                })?;
                SizingMode::Fixed { lots }
            }
            SizingType::Dynamic => {
                let tiers = self.dynamic.clone().ok_or_else(|| {
                    Error::Config(format!("rule set '{name}': dynamic sizing needs a tier table"))
                })?;
                if tiers.is_empty() {
                    return Err(Error::Config(format!(
                        "rule set '{name}': dynamic tier table is empty"
                    )));
                }
                SizingMode::Dynamic { tiers }
            }
        };

        Ok(RuleSet {
            name: name.to_string(),
            sizing,
            max_daily_trades: self.max_daily_trades,
            max_daily_loss: self.max_daily_loss,
            min_time_between_trades_ms: self.min_time_between_trades,
            max_open_positions: self.max_open_positions,
            max_concurrent_cycles: self.max_concurrent_cycles,
            filters: self.filters.clone(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub id: String,
    pub name: String,
    pub source: String,
    pub destination: String,
    pub rule_set: String,
    pub enabled: bool,
    #[serde(default)]
    pub copy_existing_positions: bool,
    #[serde(default)]
    pub notifications: NotificationFlags,
    #[serde(default)]
    pub stop_loss_buffer_pips: Decimal,
    #[serde(default)]
    pub take_profit_buffer_pips: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalSettings {
    #[serde(default)]
    pub emergency_stop_loss: EmergencyStopLossConfig,
    #[serde(default)]
    pub alert_settings: AlertSettingsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStopLossConfig {
    pub enabled: bool,
    pub daily_loss_limit: Decimal,
}

impl Default for EmergencyStopLossConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            daily_loss_limit: Decimal::new(5000, 0),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertSettingsConfig {
    pub prop_firm_warning_threshold: Decimal,
    pub consecutive_loss_alert: u32,
    pub slippage_threshold_pips: Decimal,
    /// "HH:MM" in UTC.
    #[serde(rename = "dailySummaryTimeUTC")]
    pub daily_summary_time_utc: String,
    /// Lowercase English weekday name.
    pub weekly_summary_day: String,
}

impl Default for AlertSettingsConfig {
    fn default() -> Self {
        Self {
            prop_firm_warning_threshold: Decimal::new(8, 1),
            consecutive_loss_alert: 3,
            slippage_threshold_pips: Decimal::new(5, 0),
            daily_summary_time_utc: "21:00".to_string(),
            weekly_summary_day: "sunday".to_string(),
        }
    }
}

impl RoutingConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: RoutingConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("malformed JSON in {}: {e}", path.display())))?;
        Ok(config)
    }

    /// Load the config, bootstrapping from the adjacent example file
    /// on first run.
    pub fn load_or_bootstrap(path: &Path) -> Result<Self> {
        if !path.exists() {
            let example = path.with_file_name("routing.example.json");
            if example.exists() {
                std::fs::copy(&example, path).map_err(|e| {
                    Error::Config(format!(
                        "cannot bootstrap {} from {}: {e}",
                        path.display(),
                        example.display()
                    ))
                })?;
                info!(path = %path.display(), "Bootstrapped routing config from example");
            } else {
                return Err(Error::Config(format!(
                    "routing config {} not found and no example to bootstrap from",
                    path.display()
                )));
            }
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let pretty = serde_json::to_string_pretty(self)?;
        std::fs::write(path, pretty)
            .map_err(|e| Error::Config(format!("cannot write {}: {e}", path.display())))?;
        Ok(())
    }

    /// Fail fast on dangling references. Unknown entries in the
    /// `filters` section are warned about and ignored.
    pub fn validate(&self) -> Result<()> {
        let mut seen_routes = HashSet::new();
        for route in &self.routes {
            if !seen_routes.insert(route.id.clone()) {
                return Err(Error::Config(format!("route '{}': duplicate id", route.id)));
            }
            if !self.accounts.contains_key(&route.source) {
                return Err(Error::Config(format!(
                    "route '{}': unknown source account '{}'",
                    route.id, route.source
                )));
            }
            if !self.accounts.contains_key(&route.destination) {
                return Err(Error::Config(format!(
                    "route '{}': unknown destination account '{}'",
                    route.id, route.destination
                )));
            }
            if !self.rule_sets.contains_key(&route.rule_set) {
                return Err(Error::Config(format!(
                    "route '{}': unknown rule set '{}'",
                    route.id, route.rule_set
                )));
            }
        }

        for (name, rule) in &self.rule_sets {
            rule.to_rule_set(name)?;
            for filter in &rule.filters {
                if !is_known_filter(filter) {
                    return Err(Error::Config(format!(
                        "rule set '{name}': unknown filter '{filter}'"
                    )));
                }
            }
        }

        for name in self.filters.keys() {
            if !is_known_filter(name) {
                warn!(filter = %name, "Ignoring parameters for unknown filter");
            }
        }

        Ok(())
    }

    pub fn route(&self, route_id: &str) -> Option<&RouteConfig> {
        self.routes.iter().find(|r| r.id == route_id)
    }

    /// Resolve a route config into the domain route. The config must
    /// have been validated.
    pub fn build_route(&self, route: &RouteConfig) -> Result<Route> {
        let source = self
            .accounts
            .get(&route.source)
            .ok_or_else(|| Error::Config(format!("route '{}': unknown source", route.id)))?;
        let destination = self
            .accounts
            .get(&route.destination)
            .ok_or_else(|| Error::Config(format!("route '{}': unknown destination", route.id)))?;

        Ok(Route {
            id: route.id.clone(),
            name: route.name.clone(),
            source: source.descriptor(&route.source),
            destination: destination.descriptor(&route.destination),
            rule_set: route.rule_set.clone(),
            enabled: route.enabled,
            copy_existing_positions: route.copy_existing_positions,
            notifications: route.notifications,
            stop_loss_buffer_pips: route.stop_loss_buffer_pips,
            take_profit_buffer_pips: route.take_profit_buffer_pips,
        })
    }

    pub fn build_rule_set(&self, name: &str) -> Result<RuleSet> {
        self.rule_sets
            .get(name)
            .ok_or_else(|| Error::Config(format!("unknown rule set '{name}'")))?
            .to_rule_set(name)
    }

    pub fn emergency_stop_config(&self) -> EmergencyStopConfig {
        EmergencyStopConfig {
            enabled: self.global_settings.emergency_stop_loss.enabled,
            daily_loss_limit: self.global_settings.emergency_stop_loss.daily_loss_limit,
            ..Default::default()
        }
    }

    pub fn alert_settings(&self) -> AlertSettings {
        let cfg = &self.global_settings.alert_settings;
        AlertSettings {
            prop_firm_warning_threshold: cfg.prop_firm_warning_threshold,
            consecutive_loss_alert: cfg.consecutive_loss_alert,
            slippage_threshold_pips: cfg.slippage_threshold_pips,
            ..Default::default()
        }
    }

    pub fn perf_config(&self) -> PerfMonitorConfig {
        let cfg = &self.global_settings.alert_settings;
        let mut perf = PerfMonitorConfig::default();
        if let Ok(time) = NaiveTime::parse_from_str(&cfg.daily_summary_time_utc, "%H:%M") {
            perf.daily_summary_time_utc = time;
        } else {
            warn!(
                value = %cfg.daily_summary_time_utc,
                "Unparseable dailySummaryTimeUTC, using default"
            );
        }
        if let Some(day) = parse_weekday(&cfg.weekly_summary_day) {
            perf.weekly_summary_day = day;
        } else {
            warn!(
                value = %cfg.weekly_summary_day,
                "Unparseable weeklySummaryDay, using default"
            );
        }
        perf
    }
}

fn parse_weekday(value: &str) -> Option<Weekday> {
    match value.to_lowercase().as_str() {
        "monday" | "mon" => Some(Weekday::Mon),
        "tuesday" | "tue" => Some(Weekday::Tue),
        "wednesday" | "wed" => Some(Weekday::Wed),
        "thursday" | "thu" => Some(Weekday::Thu),
        "friday" | "fri" => Some(Weekday::Fri),
        "saturday" | "sat" => Some(Weekday::Sat),
        "sunday" | "sun" => Some(Weekday::Sun),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "accounts": {
                "acct-src": {
                    "nickname": "Source",
                    "platform": "mt5",
                    "region": "london",
                    "type": "live",
                    "initialBalance": "50000"
                },
                "acct-dst": {
                    "nickname": "Funded",
                    "platform": "mt5",
                    "region": "london",
                    "type": "prop-funded",
                    "initialBalance": "100000"
                }
            },
            "ruleSets": {
                "conservative": {
                    "type": "proportional",
                    "multiplier": "2.0",
                    "maxDailyTrades": 10,
                    "maxDailyLoss": "2000",
                    "minTimeBetweenTrades": 1800000,
                    "maxOpenPositions": 5,
                    "filters": ["already-processed", "min-interval"]
                }
            },
            "filters": {
                "min-interval": { "minIntervalMs": 1800000 }
            },
            "routes": [
                {
                    "id": "r1",
                    "name": "Source to Funded",
                    "source": "acct-src",
                    "destination": "acct-dst",
                    "ruleSet": "conservative",
                    "enabled": true,
                    "copyExistingPositions": false,
                    "notifications": { "onCopy": true, "onFilter": false, "onError": true }
                }
            ],
            "globalSettings": {
                "emergencyStopLoss": { "enabled": true, "dailyLossLimit": "3000" },
                "alertSettings": {
                    "propFirmWarningThreshold": "0.8",
                    "consecutiveLossAlert": 3,
                    "slippageThresholdPips": "5",
                    "dailySummaryTimeUTC": "21:00",
                    "weeklySummaryDay": "sunday"
                }
            }
        }"#
    }

    #[test]
    fn test_sample_config_parses_and_validates() {
        let config: RoutingConfig = serde_json::from_str(sample_json()).unwrap();
        config.validate().unwrap();

        let rule = config.build_rule_set("conservative").unwrap();
        assert_eq!(rule.max_daily_trades, 10);
        assert_eq!(rule.min_time_between_trades_ms, 1_800_000);

        let route = config.build_route(&config.routes[0]).unwrap();
        assert_eq!(route.source.nickname, "Source");
        assert_eq!(route.destination.account_type, AccountType::PropFunded);
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let mut value: serde_json::Value = serde_json::from_str(sample_json()).unwrap();
        value["futureKnob"] = serde_json::json!({"whatever": 1});
        let config: RoutingConfig = serde_json::from_value(value).unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_account_reference_fails_naming_the_route() {
        let mut config: RoutingConfig = serde_json::from_str(sample_json()).unwrap();
        config.routes[0].destination = "acct-nope".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("r1"));
        assert!(err.contains("acct-nope"));
    }

    #[test]
    fn test_unknown_rule_set_reference_fails() {
        let mut config: RoutingConfig = serde_json::from_str(sample_json()).unwrap();
        config.routes[0].rule_set = "aggressive".to_string();

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("aggressive"));
    }

    #[test]
    fn test_unknown_filter_name_fails() {
        let mut config: RoutingConfig = serde_json::from_str(sample_json()).unwrap();
        config
            .rule_sets
            .get_mut("conservative")
            .unwrap()
            .filters
            .push("no-such-filter".to_string());

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("no-such-filter"));
    }

    #[test]
    fn test_proportional_without_multiplier_fails() {
        let mut config: RoutingConfig = serde_json::from_str(sample_json()).unwrap();
        config.rule_sets.get_mut("conservative").unwrap().multiplier = None;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_route_ids_fail() {
        let mut config: RoutingConfig = serde_json::from_str(sample_json()).unwrap();
        let duplicate = config.routes[0].clone();
        config.routes.push(duplicate);

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("duplicate"));
    }

    #[test]
    fn test_perf_config_parses_summary_schedule() {
        let config: RoutingConfig = serde_json::from_str(sample_json()).unwrap();
        let perf = config.perf_config();
        assert_eq!(perf.daily_summary_time_utc, NaiveTime::from_hms_opt(21, 0, 0).unwrap());
        assert_eq!(perf.weekly_summary_day, Weekday::Sun);
    }
}
