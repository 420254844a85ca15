//! Routes and their notification context.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::account::AccountDescriptor;

/// Per-event notification switches for a route.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationFlags {
    pub on_copy: bool,
    pub on_filter: bool,
    pub on_error: bool,
}

impl Default for NotificationFlags {
    fn default() -> Self {
        Self {
            on_copy: true,
            on_filter: false,
            on_error: true,
        }
    }
}

/// A configured copy route. One worker per enabled route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub name: String,
    pub source: AccountDescriptor,
    pub destination: AccountDescriptor,
    pub rule_set: String,
    pub enabled: bool,
    #[serde(default)]
    pub copy_existing_positions: bool,
    #[serde(default)]
    pub notifications: NotificationFlags,
    /// Loosening applied to mirrored stop-losses, in pips.
    #[serde(default)]
    pub stop_loss_buffer_pips: Decimal,
    /// Loosening applied to mirrored take-profits, in pips.
    #[serde(default)]
    pub take_profit_buffer_pips: Decimal,
}

/// Context injected into every notifier call for a route.
#[derive(Debug, Clone)]
pub struct RouteContext {
    pub route_id: String,
    pub source_nickname: String,
    pub dest_nickname: String,
    pub rule_name: String,
    pub notifications: NotificationFlags,
}

impl RouteContext {
    pub fn for_route(route: &Route) -> Self {
        Self {
            route_id: route.id.clone(),
            source_nickname: route.source.nickname.clone(),
            dest_nickname: route.destination.nickname.clone(),
            rule_name: route.rule_set.clone(),
            notifications: route.notifications,
        }
    }
}
