//! Common types used across labcompat

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

// =============================================================================
// Enums
// =============================================================================

/// User role for authorization decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
}

impl Default for UserRole {
    fn default() -> Self {
        Self::User
    }
}

impl UserRole {
    pub fn is_admin(&self) -> bool {
        matches!(self, Self::Admin)
    }

    /// Parse a role from string (case insensitive), defaulting to User
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "admin" => Self::Admin,
            _ => Self::User,
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::User => write!(f, "user"),
        }
    }
}

/// Analysis request status
///
/// The wire values stay in Portuguese for frontend compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    EmAndamento,
    Finalizado,
}

impl Default for RequestStatus {
    fn default() -> Self {
        Self::EmAndamento
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmAndamento => write!(f, "em_andamento"),
            Self::Finalizado => write!(f, "finalizado"),
        }
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "em_andamento" => Ok(Self::EmAndamento),
            "finalizado" => Ok(Self::Finalizado),
            _ => Err(format!("Invalid request status: {}", s)),
        }
    }
}

/// Local subscription lifecycle status
///
/// The `status` column stays free-text because it mirrors the external
/// processor's state machine; this enum covers the states the local
/// state machine writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    PastDue,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Database Models
// =============================================================================

/// User account
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub role: String,
    /// Back-reference to the subscription this account is linked to as
    /// a member. NULL when the account is unlinked.
    pub subscription_id: Option<i64>,
    pub has_purchased: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl User {
    pub fn role(&self) -> UserRole {
        UserRole::from_str_lossy(&self.role)
    }
}

/// Subscription plan
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: i64,
    pub name: String,
    pub monthly_price_cents: i64,
    pub monthly_credits: i64,
    pub time_priority: i32,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl Plan {
    /// Enterprise plans enable member accounts and credit transfers.
    pub fn is_enterprise(&self) -> bool {
        self.name.to_lowercase().contains("enterprise")
    }
}

/// Local mirror of an external recurring-billing subscription
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Subscription {
    pub id: i64,
    pub owner_id: i64,
    pub plan_id: i64,
    pub active: bool,
    pub provider_subscription_id: Option<String>,
    pub provider_customer_id: Option<String>,
    pub provider_price_id: Option<String>,
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub canceled_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// One signed addition or deduction of credits
///
/// Packets are append-only: created once, never mutated or deleted.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditPacket {
    pub id: i64,
    pub user_id: i64,
    pub quantity: i64,
    pub origin: String,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

/// Versioned global configuration snapshot
///
/// The row with `current = true` is authoritative; new rows are created
/// per change, never updated in place.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SystemConfig {
    pub id: i64,
    pub credit_price_cents: i64,
    pub request_price_credits: i64,
    pub validity_days: i32,
    pub description: Option<String>,
    pub current: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub established_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

/// Idempotency record for one external webhook notification
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ExternalEventRecord {
    pub id: i64,
    pub event_id: String,
    pub event_type: String,
    pub processed: bool,
    pub payload: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
}

/// Catalog product (chemical or biological)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub gender: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// A unit of work consuming credits
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AnalysisRequest {
    pub id: i64,
    pub user_id: i64,
    pub chemical_product_id: i64,
    pub biological_product_id: i64,
    pub priority: i32,
    pub status: String,
    pub final_result: Option<String>,
    pub result_notes: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub requested_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resulted_at: Option<OffsetDateTime>,
}

/// One-off credit purchase record created from checkout events
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Purchase {
    pub id: i64,
    pub user_id: Option<i64>,
    pub amount_paid_cents: Option<i64>,
    pub description: Option<String>,
    pub checkout_session_id: String,
    pub payment_intent_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_user_role_parse() {
        assert_eq!(UserRole::from_str_lossy("admin"), UserRole::Admin);
        assert_eq!(UserRole::from_str_lossy("ADMIN"), UserRole::Admin);
        assert_eq!(UserRole::from_str_lossy("user"), UserRole::User);
        assert_eq!(UserRole::from_str_lossy("unknown"), UserRole::User);
        assert!(UserRole::Admin.is_admin());
        assert!(!UserRole::User.is_admin());
    }

    #[test]
    fn test_request_status_roundtrip() {
        assert_eq!(RequestStatus::EmAndamento.to_string(), "em_andamento");
        assert_eq!(RequestStatus::Finalizado.to_string(), "finalizado");
        assert_eq!(
            RequestStatus::from_str("em_andamento").unwrap(),
            RequestStatus::EmAndamento
        );
        assert!(RequestStatus::from_str("pendente").is_err());
    }

    #[test]
    fn test_subscription_status_as_str() {
        assert_eq!(SubscriptionStatus::Active.as_str(), "active");
        assert_eq!(SubscriptionStatus::PastDue.as_str(), "past_due");
        assert_eq!(SubscriptionStatus::Canceled.as_str(), "canceled");
    }

    #[test]
    fn test_enterprise_plan_detection() {
        let plan = Plan {
            id: 1,
            name: "Enterprise Anual".to_string(),
            monthly_price_cents: 99900,
            monthly_credits: 100,
            time_priority: 1,
            created_at: OffsetDateTime::UNIX_EPOCH,
        };
        assert!(plan.is_enterprise());

        let basic = Plan {
            name: "Essencial".to_string(),
            ..plan
        };
        assert!(!basic.is_enterprise());
    }
}
