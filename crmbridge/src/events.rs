//! Upstream event kinds.

use serde::{Deserialize, Serialize};

/// Upstream event kinds this relay understands.
///
/// The catalog is closed: kinds outside it are classified as unsupported by
/// the router and acknowledged without downstream effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// Customer profile changed
    #[serde(rename = "customer.updated")]
    CustomerUpdated,
    /// Subscription created
    #[serde(rename = "customer.subscription.created")]
    SubscriptionCreated,
    /// Subscription changed (plan, status, period)
    #[serde(rename = "customer.subscription.updated")]
    SubscriptionUpdated,
    /// Subscription canceled
    #[serde(rename = "customer.subscription.deleted")]
    SubscriptionDeleted,
    /// Checkout session completed successfully
    #[serde(rename = "checkout.session.completed")]
    CheckoutCompleted,
    /// Checkout session expired before completion
    #[serde(rename = "checkout.session.expired")]
    CheckoutExpired,
    /// One-off payment captured
    #[serde(rename = "payment_intent.succeeded")]
    PaymentSucceeded,
    /// One-off payment failed
    #[serde(rename = "payment_intent.payment_failed")]
    PaymentFailed,
    /// Recurring invoice paid
    #[serde(rename = "invoice.payment_succeeded")]
    InvoicePaymentSucceeded,
    /// Recurring invoice payment failed
    #[serde(rename = "invoice.payment_failed")]
    InvoicePaymentFailed,
}

impl EventKind {
    /// All known kinds, in catalog order.
    pub const ALL: [EventKind; 10] = [
        EventKind::CustomerUpdated,
        EventKind::SubscriptionCreated,
        EventKind::SubscriptionUpdated,
        EventKind::SubscriptionDeleted,
        EventKind::CheckoutCompleted,
        EventKind::CheckoutExpired,
        EventKind::PaymentSucceeded,
        EventKind::PaymentFailed,
        EventKind::InvoicePaymentSucceeded,
        EventKind::InvoicePaymentFailed,
    ];
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::CustomerUpdated => "customer.updated",
            Self::SubscriptionCreated => "customer.subscription.created",
            Self::SubscriptionUpdated => "customer.subscription.updated",
            Self::SubscriptionDeleted => "customer.subscription.deleted",
            Self::CheckoutCompleted => "checkout.session.completed",
            Self::CheckoutExpired => "checkout.session.expired",
            Self::PaymentSucceeded => "payment_intent.succeeded",
            Self::PaymentFailed => "payment_intent.payment_failed",
            Self::InvoicePaymentSucceeded => "invoice.payment_succeeded",
            Self::InvoicePaymentFailed => "invoice.payment_failed",
        };
        write!(f, "{name}")
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "customer.updated" => Ok(Self::CustomerUpdated),
            "customer.subscription.created" => Ok(Self::SubscriptionCreated),
            "customer.subscription.updated" => Ok(Self::SubscriptionUpdated),
            "customer.subscription.deleted" => Ok(Self::SubscriptionDeleted),
            "checkout.session.completed" => Ok(Self::CheckoutCompleted),
            "checkout.session.expired" => Ok(Self::CheckoutExpired),
            "payment_intent.succeeded" => Ok(Self::PaymentSucceeded),
            "payment_intent.payment_failed" => Ok(Self::PaymentFailed),
            "invoice.payment_succeeded" => Ok(Self::InvoicePaymentSucceeded),
            "invoice.payment_failed" => Ok(Self::InvoicePaymentFailed),
            _ => Err(format!("Unknown event kind: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_from_str() {
        assert_eq!(
            "checkout.session.completed".parse::<EventKind>().unwrap(),
            EventKind::CheckoutCompleted
        );
        assert!("order.created".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_display_round_trips_for_all_kinds() {
        for kind in EventKind::ALL {
            assert_eq!(kind.to_string().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_serde_names_match_display() {
        for kind in EventKind::ALL {
            let as_json = serde_json::to_string(&kind).unwrap();
            assert_eq!(as_json, format!("\"{kind}\""));
        }
    }
}
