//! Payment provider webhook events
//!
//! The provider posts events shaped `{id, type, data: {object}}`. The
//! recognized set is closed: everything outside it is acknowledged and
//! recorded as processed without side effects, so provider retries
//! short-circuit.

use std::collections::HashMap;

use serde::Deserialize;

/// Metadata keys the provider may use for the local user id
pub const USER_ID_KEYS: &[&str] = &["userId", "user_id", "usuarioId", "user"];
/// Metadata keys the provider may use for the local plan id
pub const PLAN_ID_KEYS: &[&str] = &["planId", "plan_id", "planoId"];
/// Metadata keys the provider may use for the buyer's email
pub const USER_EMAIL_KEYS: &[&str] = &["user_email", "userEmail"];

/// Recognized external event kinds
///
/// Dispatch is a closed match over this enum; `Unrecognized` is the
/// ignore-and-acknowledge arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    CheckoutSessionCompleted,
    InvoicePaid,
    InvoicePaymentFailed,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    PaymentSucceeded,
    CustomerUpdated,
    Unrecognized,
}

impl EventKind {
    pub fn from_type(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => Self::CheckoutSessionCompleted,
            "invoice.paid" | "invoice.payment_succeeded" => Self::InvoicePaid,
            "invoice.payment_failed" => Self::InvoicePaymentFailed,
            "customer.subscription.created" => Self::SubscriptionCreated,
            "customer.subscription.updated" => Self::SubscriptionUpdated,
            "customer.subscription.deleted" => Self::SubscriptionDeleted,
            "payment_intent.succeeded" | "charge.succeeded" => Self::PaymentSucceeded,
            "customer.updated" => Self::CustomerUpdated,
            _ => Self::Unrecognized,
        }
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, Self::Unrecognized)
    }
}

/// Raw webhook envelope
#[derive(Debug, Clone, Deserialize)]
pub struct EventEnvelope {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: EventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EventData {
    #[serde(default)]
    pub object: serde_json::Value,
}

impl EventEnvelope {
    pub fn kind(&self) -> EventKind {
        EventKind::from_type(&self.event_type)
    }
}

/// A reference that may arrive as a bare id or as an expanded object
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Object { id } => id,
        }
    }
}

/// `checkout.session.completed` payload
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutSession {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub payment_intent: Option<Expandable>,
    #[serde(default)]
    pub amount_total: Option<i64>,
    #[serde(default)]
    pub currency: Option<String>,
    #[serde(default)]
    pub payment_status: Option<String>,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
}

/// `invoice.*` payload
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceObject {
    pub id: String,
    #[serde(default)]
    pub subscription: Option<Expandable>,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub total: Option<i64>,
    #[serde(default)]
    pub lines: InvoiceLines,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InvoiceObject {
    /// Period end of the first invoice line, the fallback source for
    /// the subscription period end when the provider lookup fails.
    pub fn first_line_period_end(&self) -> Option<i64> {
        self.lines
            .data
            .first()
            .and_then(|line| line.period.as_ref())
            .and_then(|period| period.end)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLines {
    #[serde(default)]
    pub data: Vec<InvoiceLine>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvoiceLine {
    #[serde(default)]
    pub period: Option<LinePeriod>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LinePeriod {
    #[serde(default)]
    pub end: Option<i64>,
}

/// `customer.subscription.*` payload (also returned by the provider's
/// retrieve-subscription call)
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionObject {
    pub id: String,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub customer: Option<Expandable>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub cancel_at_period_end: Option<bool>,
    #[serde(default)]
    pub canceled_at: Option<i64>,
    #[serde(default)]
    pub items: SubscriptionItems,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    pub fn price_id(&self) -> Option<&str> {
        self.items
            .data
            .first()
            .and_then(|item| item.price.as_ref())
            .map(|price| price.id.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItems {
    #[serde(default)]
    pub data: Vec<SubscriptionItem>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionItem {
    #[serde(default)]
    pub price: Option<PriceRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceRef {
    pub id: String,
}

/// `payment_intent.succeeded` / `charge.succeeded` payload
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentObject {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub payment_intent: Option<Expandable>,
    #[serde(default)]
    pub amount_received: Option<i64>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub status: Option<String>,
}

impl PaymentObject {
    /// Best identifier for matching a purchase record: the payment
    /// intent reference when present (charge payloads), else the
    /// object's own id (payment intent payloads).
    pub fn payment_intent_id(&self) -> Option<&str> {
        self.payment_intent
            .as_ref()
            .map(|e| e.id())
            .or(self.id.as_deref())
    }

    pub fn amount_cents(&self) -> Option<i64> {
        self.amount_received.or(self.amount)
    }
}

// =============================================================================
// Metadata helpers
// =============================================================================

/// First parseable integer among the candidate metadata keys
pub fn meta_i64(metadata: &HashMap<String, String>, keys: &[&str]) -> Option<i64> {
    keys.iter()
        .filter_map(|key| metadata.get(*key))
        .find_map(|value| value.trim().parse::<i64>().ok())
}

/// First non-empty string among the candidate metadata keys
pub fn meta_str<'a>(metadata: &'a HashMap<String, String>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|key| metadata.get(*key))
        .map(|value| value.trim())
        .find(|value| !value.is_empty())
}

/// Parse a CSV of integer ids (`"1, 2,x,3"` -> `[1, 2, 3]`)
pub fn parse_csv_ids(raw: &str) -> Vec<i64> {
    let mut ids: Vec<i64> = raw
        .split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}

/// Parse a CSV of emails, lowercased and deduplicated
pub fn parse_csv_emails(raw: &str) -> Vec<String> {
    let mut emails: Vec<String> = raw
        .split(',')
        .map(|part| part.trim().to_lowercase())
        .filter(|email| !email.is_empty())
        .collect();
    emails.sort();
    emails.dedup();
    emails
}

// =============================================================================
// Origin tags
// =============================================================================

/// Origin tag for the credit grant of a subscription checkout
pub fn subscription_checkout_origin(subscription_id: &str, session_id: &str) -> String {
    format!(
        "stripe:subscription:{}:checkout_session:{}",
        subscription_id, session_id
    )
}

/// Origin tag for the credit grant of a paid invoice
pub fn subscription_invoice_origin(subscription_id: &str, invoice_id: &str) -> String {
    format!("stripe:subscription:{}:invoice:{}", subscription_id, invoice_id)
}

/// Origin tag for a one-off credit purchase
pub fn one_off_origin(session_id: &str, local_order_id: Option<&str>) -> String {
    match local_order_id {
        Some(order) => format!("stripe:session:{}:local:{}", session_id, order),
        None => format!("stripe:session:{}", session_id),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_event_kind_recognized_set() {
        assert_eq!(
            EventKind::from_type("checkout.session.completed"),
            EventKind::CheckoutSessionCompleted
        );
        assert_eq!(EventKind::from_type("invoice.paid"), EventKind::InvoicePaid);
        assert_eq!(
            EventKind::from_type("invoice.payment_succeeded"),
            EventKind::InvoicePaid
        );
        assert_eq!(
            EventKind::from_type("invoice.payment_failed"),
            EventKind::InvoicePaymentFailed
        );
        assert_eq!(
            EventKind::from_type("customer.subscription.deleted"),
            EventKind::SubscriptionDeleted
        );
        assert_eq!(
            EventKind::from_type("payment_intent.succeeded"),
            EventKind::PaymentSucceeded
        );
        assert_eq!(
            EventKind::from_type("charge.succeeded"),
            EventKind::PaymentSucceeded
        );
        assert_eq!(
            EventKind::from_type("customer.updated"),
            EventKind::CustomerUpdated
        );
        assert_eq!(
            EventKind::from_type("invoice.finalized"),
            EventKind::Unrecognized
        );
        assert!(!EventKind::Unrecognized.is_recognized());
    }

    #[test]
    fn test_envelope_parse() {
        let raw = serde_json::json!({
            "id": "evt_123",
            "type": "checkout.session.completed",
            "data": {
                "object": {
                    "id": "cs_456",
                    "amount_total": 1000,
                    "payment_status": "paid",
                    "metadata": {"user_id": "7"}
                }
            }
        });
        let envelope: EventEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.id.as_deref(), Some("evt_123"));
        assert_eq!(envelope.kind(), EventKind::CheckoutSessionCompleted);

        let session: CheckoutSession = serde_json::from_value(envelope.data.object).unwrap();
        assert_eq!(session.id, "cs_456");
        assert_eq!(session.amount_total, Some(1000));
        assert_eq!(meta_i64(&session.metadata, USER_ID_KEYS), Some(7));
    }

    #[test]
    fn test_expandable_accepts_id_and_object() {
        let bare: Expandable = serde_json::from_value(serde_json::json!("sub_1")).unwrap();
        assert_eq!(bare.id(), "sub_1");

        let expanded: Expandable =
            serde_json::from_value(serde_json::json!({"id": "sub_2", "status": "active"})).unwrap();
        assert_eq!(expanded.id(), "sub_2");
    }

    #[test]
    fn test_payment_object_prefers_payment_intent_field() {
        let charge: PaymentObject = serde_json::from_value(serde_json::json!({
            "id": "ch_1",
            "payment_intent": "pi_1",
            "amount": 500
        }))
        .unwrap();
        assert_eq!(charge.payment_intent_id(), Some("pi_1"));
        assert_eq!(charge.amount_cents(), Some(500));

        let intent: PaymentObject = serde_json::from_value(serde_json::json!({
            "id": "pi_2",
            "amount_received": 900,
            "amount": 1000
        }))
        .unwrap();
        assert_eq!(intent.payment_intent_id(), Some("pi_2"));
        assert_eq!(intent.amount_cents(), Some(900));
    }

    #[test]
    fn test_metadata_helpers() {
        let mut metadata = HashMap::new();
        metadata.insert("usuarioId".to_string(), "42".to_string());
        metadata.insert("plan_id".to_string(), " 3 ".to_string());
        assert_eq!(meta_i64(&metadata, USER_ID_KEYS), Some(42));
        assert_eq!(meta_i64(&metadata, PLAN_ID_KEYS), Some(3));
        assert_eq!(meta_i64(&metadata, &["missing"]), None);

        assert_eq!(parse_csv_ids("1, 2,x,3,2"), vec![1, 2, 3]);
        assert_eq!(
            parse_csv_emails("A@x.com, b@y.com ,,a@x.com"),
            vec!["a@x.com".to_string(), "b@y.com".to_string()]
        );
    }

    #[test]
    fn test_origin_tag_formats() {
        assert_eq!(
            subscription_checkout_origin("sub_1", "cs_2"),
            "stripe:subscription:sub_1:checkout_session:cs_2"
        );
        assert_eq!(
            subscription_invoice_origin("sub_1", "in_9"),
            "stripe:subscription:sub_1:invoice:in_9"
        );
        assert_eq!(one_off_origin("cs_2", None), "stripe:session:cs_2");
        assert_eq!(
            one_off_origin("cs_2", Some("77")),
            "stripe:session:cs_2:local:77"
        );
    }
}
