//! Routing of verified events onto processing lanes.
//!
//! Classification is a pure lookup over a closed table: each known kind maps
//! to the immediate lane or to a deferred accumulation category, and anything
//! outside the catalog is explicitly unsupported. The table ships with
//! defaults matching the upstream catalog and can be overridden per kind from
//! configuration. Payload contents are never inspected here.

use std::collections::HashMap;

use conveyor::Lane;
use serde::{Deserialize, Serialize};

use crate::events::EventKind;

/// Category collecting deferred customer profile updates.
pub const CUSTOMER_UPDATES: &str = "customer-updates";

/// Where an event kind is processed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Delivered one-by-one from the immediate lane
    Immediate,
    /// Accumulated into the named batch category on the deferred lane
    Deferred { category: String },
    /// Outside the catalog; acknowledged and ignored
    Unsupported,
}

impl Route {
    /// Queue lane backing this route. Unsupported kinds ride the immediate
    /// lane so the worker can record the ignored disposition promptly.
    pub fn lane(&self) -> Lane {
        match self {
            Route::Immediate | Route::Unsupported => Lane::Immediate,
            Route::Deferred { .. } => Lane::Deferred,
        }
    }
}

/// Per-kind routing override, merged over the default table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteOverride {
    Immediate,
    Deferred { category: String },
}

/// Classifies event kinds onto routes.
#[derive(Debug, Clone)]
pub struct EventRouter {
    table: HashMap<EventKind, Route>,
}

impl Default for EventRouter {
    fn default() -> Self {
        Self { table: default_table() }
    }
}

impl EventRouter {
    /// Build a router from the default table with per-kind overrides applied.
    ///
    /// Override keys must name kinds from the catalog; an unknown key is a
    /// configuration error.
    pub fn with_overrides(overrides: &HashMap<String, RouteOverride>) -> Result<Self, String> {
        let mut table = default_table();

        for (kind, route) in overrides {
            let kind: EventKind = kind.parse()?;
            let route = match route {
                RouteOverride::Immediate => Route::Immediate,
                RouteOverride::Deferred { category } => {
                    if category.is_empty() {
                        return Err(format!("Deferred category for {} must not be empty", kind));
                    }
                    Route::Deferred {
                        category: category.clone(),
                    }
                }
            };
            table.insert(kind, route);
        }

        Ok(Self { table })
    }

    /// Classify an event kind string; unknown kinds are unsupported.
    pub fn classify(&self, kind: &str) -> Route {
        match kind.parse::<EventKind>() {
            Ok(kind) => self.route(kind),
            Err(_) => Route::Unsupported,
        }
    }

    /// Route for a kind already parsed from the catalog.
    pub fn route(&self, kind: EventKind) -> Route {
        self.table.get(&kind).cloned().unwrap_or(Route::Unsupported)
    }
}

fn default_table() -> HashMap<EventKind, Route> {
    let mut table = HashMap::new();
    table.insert(
        EventKind::CustomerUpdated,
        Route::Deferred {
            category: CUSTOMER_UPDATES.to_string(),
        },
    );
    for kind in [
        EventKind::SubscriptionCreated,
        EventKind::SubscriptionUpdated,
        EventKind::SubscriptionDeleted,
        EventKind::CheckoutCompleted,
        EventKind::CheckoutExpired,
        EventKind::PaymentSucceeded,
        EventKind::PaymentFailed,
        EventKind::InvoicePaymentSucceeded,
        EventKind::InvoicePaymentFailed,
    ] {
        table.insert(kind, Route::Immediate);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("customer.subscription.created")]
    #[case("customer.subscription.updated")]
    #[case("customer.subscription.deleted")]
    #[case("checkout.session.completed")]
    #[case("checkout.session.expired")]
    #[case("payment_intent.succeeded")]
    #[case("payment_intent.payment_failed")]
    #[case("invoice.payment_succeeded")]
    #[case("invoice.payment_failed")]
    fn default_table_routes_immediately(#[case] kind: &str) {
        let router = EventRouter::default();
        assert_eq!(router.classify(kind), Route::Immediate);
    }

    #[test]
    fn customer_updates_are_deferred_by_default() {
        let router = EventRouter::default();
        assert_eq!(
            router.classify("customer.updated"),
            Route::Deferred {
                category: CUSTOMER_UPDATES.to_string()
            }
        );
    }

    #[test]
    fn unknown_kinds_are_unsupported() {
        let router = EventRouter::default();
        assert_eq!(router.classify("order.created"), Route::Unsupported);
        assert_eq!(router.classify(""), Route::Unsupported);
    }

    #[test]
    fn overrides_replace_default_routes() {
        let mut overrides = HashMap::new();
        overrides.insert("customer.updated".to_string(), RouteOverride::Immediate);
        overrides.insert(
            "invoice.payment_succeeded".to_string(),
            RouteOverride::Deferred {
                category: "invoice-sync".to_string(),
            },
        );

        let router = EventRouter::with_overrides(&overrides).unwrap();
        assert_eq!(router.classify("customer.updated"), Route::Immediate);
        assert_eq!(
            router.classify("invoice.payment_succeeded"),
            Route::Deferred {
                category: "invoice-sync".to_string()
            }
        );
        // Untouched kinds keep their defaults
        assert_eq!(router.classify("payment_intent.succeeded"), Route::Immediate);
    }

    #[test]
    fn override_for_unknown_kind_is_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert("order.created".to_string(), RouteOverride::Immediate);
        assert!(EventRouter::with_overrides(&overrides).is_err());
    }

    #[test]
    fn lanes_follow_routes() {
        assert_eq!(Route::Immediate.lane(), Lane::Immediate);
        assert_eq!(Route::Unsupported.lane(), Lane::Immediate);
        assert_eq!(
            Route::Deferred {
                category: "x".to_string()
            }
            .lane(),
            Lane::Deferred
        );
    }
}
