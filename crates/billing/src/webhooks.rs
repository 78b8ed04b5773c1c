//! Payment webhook reconciliation pipeline
//!
//! Strictly ordered: verify signature → require event id → closed-set
//! dispatch check → idempotency claim → one transaction applying the
//! event to subscription and ledger state → mark processed inside that
//! transaction → commit → best-effort notification emails.
//!
//! Any failure inside the transaction rolls everything back and leaves
//! the event unprocessed, so the provider's retry re-runs the whole
//! event. Retries are harmless: grants are keyed by origin tag, row
//! creation is existence-checked, and flag updates are one-way.

use hmac::{Hmac, Mac};
use labcompat_shared::User;
use sha2::Sha256;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;

use crate::client::PaymentClient;
use crate::config::PaymentConfig;
use crate::email::{EmailService, Notification};
use crate::error::{BillingError, BillingResult};
use crate::events::{
    meta_i64, meta_str, one_off_origin, subscription_checkout_origin,
    subscription_invoice_origin, CheckoutSession, EventEnvelope, EventKind, InvoiceObject,
    PaymentObject, SubscriptionObject, PLAN_ID_KEYS, USER_EMAIL_KEYS, USER_ID_KEYS,
};
use crate::guard::{BeginOutcome, ExternalEventStore};
use crate::ledger::{self, Granted};
use crate::purchases;
use crate::settings;
use crate::audit;
use crate::subscriptions::{self, SubscriptionPatch};

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted age of a signed webhook, in seconds
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

const USER_COLUMNS: &str =
    "id, name, email, password_hash, role, subscription_id, has_purchased, created_at";

/// Acknowledgment returned to the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Processed,
    Ignored,
    AlreadyProcessed,
}

impl Ack {
    pub fn note(&self) -> Option<&'static str> {
        match self {
            Self::Processed => None,
            Self::Ignored => Some("ignored_event_type"),
            Self::AlreadyProcessed => Some("already_processed"),
        }
    }
}

/// Verify a `t=...,v1=...` signature header against the raw payload.
///
/// Manual HMAC-SHA256 verification: the signed payload is
/// `"{timestamp}.{body}"` and the secret's `whsec_` prefix is not part
/// of the key.
pub fn verify_signature(
    payload: &str,
    signature: &str,
    secret: &str,
    now: i64,
) -> BillingResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature.split(',') {
        let mut kv = part.splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(value)) => timestamp = value.trim().parse().ok(),
            (Some("v1"), Some(value)) => v1_signature = Some(value.trim()),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(BillingError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(BillingError::WebhookSignatureInvalid)?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now,
            "Webhook timestamp outside tolerance"
        );
        return Err(BillingError::WebhookSignatureInvalid);
    }

    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook handler for payment provider events
pub struct WebhookHandler {
    pool: PgPool,
    config: PaymentConfig,
    client: PaymentClient,
    email: EmailService,
    events: ExternalEventStore,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, config: PaymentConfig, email: EmailService) -> Self {
        let client = PaymentClient::new(config.clone());
        let events = ExternalEventStore::new(pool.clone());
        Self {
            pool,
            config,
            client,
            email,
            events,
        }
    }

    /// Verify and parse a webhook delivery. No state is mutated on
    /// failure. An empty webhook secret (development only) skips
    /// signature verification with a warning.
    pub fn verify_event(
        &self,
        payload: &str,
        signature: Option<&str>,
    ) -> BillingResult<(EventEnvelope, serde_json::Value)> {
        if self.config.webhook_secret.is_empty() {
            tracing::warn!("Webhook secret not configured, accepting unsigned event");
        } else {
            let signature = signature.ok_or(BillingError::WebhookSignatureInvalid)?;
            verify_signature(
                payload,
                signature,
                &self.config.webhook_secret,
                OffsetDateTime::now_utc().unix_timestamp(),
            )?;
        }

        let raw: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| BillingError::InvalidEvent(format!("invalid JSON: {}", e)))?;
        let envelope: EventEnvelope = serde_json::from_value(raw.clone())
            .map_err(|e| BillingError::InvalidEvent(format!("invalid envelope: {}", e)))?;
        Ok((envelope, raw))
    }

    /// Verify, dedupe and apply one webhook delivery end to end.
    pub async fn process(&self, payload: &str, signature: Option<&str>) -> BillingResult<Ack> {
        let (envelope, raw) = self.verify_event(payload, signature)?;
        self.handle_event(envelope, raw).await
    }

    /// Handle a verified event.
    pub async fn handle_event(
        &self,
        envelope: EventEnvelope,
        raw: serde_json::Value,
    ) -> BillingResult<Ack> {
        let event_id = envelope
            .id
            .clone()
            .ok_or_else(|| BillingError::InvalidEvent("missing event id".to_string()))?;
        let kind = envelope.kind();

        if !kind.is_recognized() {
            tracing::info!(
                event_id = %event_id,
                event_type = %envelope.event_type,
                "Unrecognized event type, recording and acknowledging"
            );
            self.events
                .record_ignored(&event_id, &envelope.event_type, &raw)
                .await?;
            return Ok(Ack::Ignored);
        }

        match self
            .events
            .begin_processing(&event_id, &envelope.event_type, &raw)
            .await?
        {
            BeginOutcome::AlreadyProcessed => return Ok(Ack::AlreadyProcessed),
            BeginOutcome::Claimed => {}
        }

        tracing::info!(
            event_id = %event_id,
            event_type = %envelope.event_type,
            "Processing webhook event"
        );

        let mut notifications: Vec<Notification> = Vec::new();
        let mut tx = self.pool.begin().await?;

        let result = self
            .dispatch(&mut tx, kind, &envelope, &mut notifications)
            .await;

        match result {
            Ok(()) => {
                ExternalEventStore::mark_processed(&mut tx, &event_id).await?;
                tx.commit().await?;
            }
            Err(e) => {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Webhook processing failed, transaction aborted; event left unprocessed"
                );
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(error = %rollback_err, "Rollback failed");
                }
                return Err(e);
            }
        }

        // Post-commit, sequential, best-effort. A failure here is
        // logged but never re-opens the transaction.
        self.email.send_all(notifications).await;

        Ok(Ack::Processed)
    }

    async fn dispatch(
        &self,
        conn: &mut PgConnection,
        kind: EventKind,
        envelope: &EventEnvelope,
        notifications: &mut Vec<Notification>,
    ) -> BillingResult<()> {
        match kind {
            EventKind::CheckoutSessionCompleted => {
                self.on_checkout_completed(conn, envelope, notifications).await
            }
            EventKind::InvoicePaid => self.on_invoice_paid(conn, envelope, notifications).await,
            EventKind::InvoicePaymentFailed => {
                self.on_invoice_failed(conn, envelope, notifications).await
            }
            EventKind::SubscriptionCreated | EventKind::SubscriptionUpdated => {
                self.on_subscription_upserted(conn, envelope, notifications).await
            }
            EventKind::SubscriptionDeleted => {
                self.on_subscription_deleted(conn, envelope, notifications).await
            }
            EventKind::PaymentSucceeded => {
                self.on_payment_succeeded(conn, envelope, notifications).await
            }
            EventKind::CustomerUpdated => {
                tracing::debug!(event_id = ?envelope.id, "customer.updated received");
                Ok(())
            }
            EventKind::Unrecognized => Ok(()),
        }
    }

    async fn on_checkout_completed(
        &self,
        conn: &mut PgConnection,
        envelope: &EventEnvelope,
        notifications: &mut Vec<Notification>,
    ) -> BillingResult<()> {
        let session: CheckoutSession = serde_json::from_value(envelope.data.object.clone())
            .map_err(|e| BillingError::InvalidEvent(format!("checkout session: {}", e)))?;

        let provider_sub_id = session.subscription.as_ref().map(|s| s.id().to_string());

        // Best-effort provider snapshot for subscription checkouts; the
        // session payload alone is enough to proceed when this fails.
        let provider_sub = match &provider_sub_id {
            Some(id) => match self.client.get_subscription(id).await {
                Ok(sub) => Some(sub),
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %id,
                        error = %e,
                        "Failed to retrieve provider subscription"
                    );
                    None
                }
            },
            None => None,
        };

        // Subscription metadata takes precedence over session metadata.
        let mut metadata = session.metadata.clone();
        if let Some(provider) = &provider_sub {
            metadata.extend(provider.metadata.clone());
        }

        let paid = session.payment_status.as_deref() == Some("paid");
        let amount_cents = session.amount_total;

        let resolved_user = self.resolve_local_user(conn, &session).await?;
        let resolved_user_id = resolved_user
            .as_ref()
            .map(|u| u.id)
            .or_else(|| meta_i64(&metadata, USER_ID_KEYS));

        let purchase =
            purchases::upsert_for_session(conn, &session, resolved_user_id, amount_cents).await?;

        if paid {
            if let Some(user_id) = purchase.user_id {
                purchases::mark_user_purchased(conn, user_id).await?;
            } else {
                tracing::info!(
                    session_id = %session.id,
                    "No local user linked to purchase, first-purchase flag not set"
                );
            }
        } else {
            tracing::info!(
                session_id = %session.id,
                payment_status = ?session.payment_status,
                "Checkout session not confirmed as paid"
            );
        }

        match provider_sub_id.as_deref() {
            Some(sub_id) => {
                self.checkout_with_subscription(
                    conn,
                    &session,
                    sub_id,
                    provider_sub.as_ref(),
                    &metadata,
                    notifications,
                )
                .await
            }
            None => {
                self.checkout_one_off(conn, &session, resolved_user, amount_cents, notifications)
                    .await
            }
        }
    }

    /// Checkout completed with a subscription reference: sync the local
    /// subscription and grant the plan's monthly credits to the owner
    /// only, keyed by (subscription, checkout session).
    async fn checkout_with_subscription(
        &self,
        conn: &mut PgConnection,
        session: &CheckoutSession,
        sub_id: &str,
        provider_sub: Option<&SubscriptionObject>,
        metadata: &std::collections::HashMap<String, String>,
        notifications: &mut Vec<Notification>,
    ) -> BillingResult<()> {
        let mut patch = provider_sub
            .map(SubscriptionPatch::from_provider)
            .unwrap_or_default();
        if patch.provider_customer_id.is_none() {
            patch.provider_customer_id = session.customer.as_ref().map(|c| c.id().to_string());
        }
        if patch.status.is_none() {
            patch.status = Some("active".to_string());
        }

        let existing = subscriptions::find_by_provider_id(conn, sub_id).await?;
        let (local, created) = match existing {
            Some(sub) => {
                subscriptions::apply_patch(conn, &sub, &patch, true).await?;
                subscriptions::link_members(conn, &sub, metadata).await?;
                (Some(sub), false)
            }
            None => {
                let plan_id = meta_i64(metadata, PLAN_ID_KEYS);
                let owner_id = meta_i64(metadata, USER_ID_KEYS);
                match (plan_id, owner_id) {
                    (Some(plan_id), Some(owner_id)) => {
                        let sub = subscriptions::create_local(
                            conn,
                            owner_id,
                            plan_id,
                            Some(sub_id),
                            &patch,
                        )
                        .await?;
                        subscriptions::link_members(conn, &sub, metadata).await?;
                        (Some(sub), true)
                    }
                    _ => {
                        tracing::warn!(
                            session_id = %session.id,
                            "Incomplete metadata for local subscription, skipping creation"
                        );
                        (None, false)
                    }
                }
            }
        };

        let Some(sub) = local else {
            return Ok(());
        };

        match subscriptions::find_plan(conn, sub.plan_id).await {
            Ok(plan) => {
                if plan.monthly_credits > 0 {
                    let origin = subscription_checkout_origin(sub_id, &session.id);
                    // Owner only; linked members never receive grants.
                    ledger::grant(conn, sub.owner_id, plan.monthly_credits, &origin).await?;
                }
                if let Some((email, name)) = owner_contact(conn, sub.owner_id).await? {
                    if created {
                        notifications.push(Notification::subscription_created(
                            &email,
                            &name,
                            &plan.name,
                            plan.monthly_price_cents,
                            plan.monthly_credits,
                        ));
                    } else {
                        notifications.push(Notification::subscription_updated(&email, &name, sub_id));
                    }
                }
            }
            Err(e) => {
                tracing::warn!(
                    subscription_id = sub.id,
                    plan_id = sub.plan_id,
                    error = %e,
                    "Plan lookup failed, no credits granted"
                );
            }
        }

        Ok(())
    }

    /// Checkout completed without a subscription reference: a one-off
    /// credit purchase priced by the authoritative config.
    async fn checkout_one_off(
        &self,
        conn: &mut PgConnection,
        session: &CheckoutSession,
        resolved_user: Option<User>,
        amount_cents: Option<i64>,
        notifications: &mut Vec<Notification>,
    ) -> BillingResult<()> {
        let Some(user) = resolved_user else {
            tracing::warn!(
                session_id = %session.id,
                "Could not resolve local user for one-off purchase"
            );
            return Ok(());
        };
        let Some(amount) = amount_cents else {
            tracing::warn!(session_id = %session.id, "Unknown amount for checkout session");
            return Ok(());
        };

        let config = match settings::current_config(conn).await {
            Ok(config) => config,
            Err(BillingError::ConfigMissing) => {
                tracing::warn!("No system configuration, cannot price one-off purchase");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if config.credit_price_cents <= 0 {
            tracing::warn!(
                credit_price_cents = config.credit_price_cents,
                "Invalid credit price, no packet created"
            );
            return Ok(());
        }

        let quantity = amount / config.credit_price_cents;
        if quantity <= 0 {
            tracing::info!(
                amount_cents = amount,
                credit_price_cents = config.credit_price_cents,
                "Amount below credit price, nothing granted"
            );
            return Ok(());
        }

        let origin = one_off_origin(
            &session.id,
            session.metadata.get("local_order_id").map(String::as_str),
        );

        if let Granted::Created(_) = ledger::grant(conn, user.id, quantity, &origin).await? {
            purchases::record_revenue(
                conn,
                Some(user.id),
                amount,
                &format!("Receita via Stripe session {}", session.id),
            )
            .await;
            notifications.push(Notification::purchase_confirmed(
                &user.email,
                &user.name,
                amount,
                quantity,
            ));
        }

        Ok(())
    }

    async fn on_invoice_paid(
        &self,
        conn: &mut PgConnection,
        envelope: &EventEnvelope,
        notifications: &mut Vec<Notification>,
    ) -> BillingResult<()> {
        let invoice: InvoiceObject = serde_json::from_value(envelope.data.object.clone())
            .map_err(|e| BillingError::InvalidEvent(format!("invoice: {}", e)))?;

        let Some(sub_id) = invoice.subscription.as_ref().map(|s| s.id().to_string()) else {
            tracing::info!(invoice_id = %invoice.id, "Invoice paid without subscription");
            return Ok(());
        };

        let Some(local) = subscriptions::find_by_provider_id(conn, &sub_id).await? else {
            tracing::warn!(
                provider_subscription_id = %sub_id,
                "No local subscription for paid invoice"
            );
            return Ok(());
        };

        let provider_sub = match self.client.get_subscription(&sub_id).await {
            Ok(sub) => Some(sub),
            Err(e) => {
                tracing::warn!(
                    subscription_id = %sub_id,
                    error = %e,
                    "Failed to retrieve provider subscription"
                );
                None
            }
        };

        let mut patch = provider_sub
            .as_ref()
            .map(SubscriptionPatch::from_provider)
            .unwrap_or_default();
        if patch.status.is_none() {
            patch.status = Some("active".to_string());
        }
        if patch.current_period_end.is_none() {
            patch.current_period_end = invoice
                .first_line_period_end()
                .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
        }

        // A successful payment re-confirms the subscription as the
        // owner's active one.
        subscriptions::apply_patch(conn, &local, &patch, true).await?;

        let metadata = provider_sub
            .map(|sub| sub.metadata)
            .unwrap_or_else(|| invoice.metadata.clone());
        subscriptions::link_members(conn, &local, &metadata).await?;

        match subscriptions::find_plan(conn, local.plan_id).await {
            Ok(plan) if plan.monthly_credits > 0 => {
                let origin = subscription_invoice_origin(&sub_id, &invoice.id);
                ledger::grant(conn, local.owner_id, plan.monthly_credits, &origin).await?;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(
                    plan_id = local.plan_id,
                    error = %e,
                    "Plan lookup failed, no credits granted for invoice"
                );
            }
        }

        if let Some((email, name)) = owner_contact(conn, local.owner_id).await? {
            notifications.push(Notification::subscription_payment_received(
                &email,
                &name,
                &sub_id,
                invoice.amount_paid.or(invoice.total),
            ));
        }

        tracing::info!(
            invoice_id = %invoice.id,
            provider_subscription_id = %sub_id,
            "Invoice paid"
        );
        Ok(())
    }

    async fn on_invoice_failed(
        &self,
        conn: &mut PgConnection,
        envelope: &EventEnvelope,
        notifications: &mut Vec<Notification>,
    ) -> BillingResult<()> {
        let invoice: InvoiceObject = serde_json::from_value(envelope.data.object.clone())
            .map_err(|e| BillingError::InvalidEvent(format!("invoice: {}", e)))?;

        let Some(sub_id) = invoice.subscription.as_ref().map(|s| s.id().to_string()) else {
            return Ok(());
        };
        let Some(local) = subscriptions::find_by_provider_id(conn, &sub_id).await? else {
            return Ok(());
        };

        subscriptions::mark_past_due(conn, local.id).await?;
        audit::log_action(
            conn,
            local.owner_id,
            &format!(
                "Falha de pagamento para assinatura {} (subscription {}, invoice {})",
                local.id, sub_id, invoice.id
            ),
        )
        .await;

        if let Some((email, name)) = owner_contact(conn, local.owner_id).await? {
            notifications.push(Notification::subscription_payment_failed(
                &email,
                &name,
                &sub_id,
                &invoice.id,
            ));
        }

        tracing::warn!(
            invoice_id = %invoice.id,
            provider_subscription_id = %sub_id,
            "Invoice payment failed, subscription past due"
        );
        Ok(())
    }

    async fn on_subscription_upserted(
        &self,
        conn: &mut PgConnection,
        envelope: &EventEnvelope,
        notifications: &mut Vec<Notification>,
    ) -> BillingResult<()> {
        let sub_obj: SubscriptionObject = serde_json::from_value(envelope.data.object.clone())
            .map_err(|e| BillingError::InvalidEvent(format!("subscription: {}", e)))?;

        let patch = SubscriptionPatch::from_provider(&sub_obj);

        match subscriptions::find_by_provider_id(conn, &sub_obj.id).await? {
            Some(local) => {
                subscriptions::apply_patch(conn, &local, &patch, false).await?;
                subscriptions::link_members(conn, &local, &sub_obj.metadata).await?;
                tracing::info!(
                    subscription_id = local.id,
                    provider_subscription_id = %sub_obj.id,
                    status = ?sub_obj.status,
                    "Subscription updated"
                );
            }
            None => {
                let plan_id = meta_i64(&sub_obj.metadata, PLAN_ID_KEYS);
                let owner_id = meta_i64(&sub_obj.metadata, USER_ID_KEYS);
                let (Some(plan_id), Some(owner_id)) = (plan_id, owner_id) else {
                    tracing::warn!(
                        provider_subscription_id = %sub_obj.id,
                        "Subscription event without local row or complete metadata, skipping"
                    );
                    return Ok(());
                };

                let sub = subscriptions::create_local(
                    conn,
                    owner_id,
                    plan_id,
                    Some(&sub_obj.id),
                    &patch,
                )
                .await?;
                subscriptions::link_members(conn, &sub, &sub_obj.metadata).await?;

                if let Ok(plan) = subscriptions::find_plan(conn, plan_id).await {
                    if let Some((email, name)) = owner_contact(conn, owner_id).await? {
                        notifications.push(Notification::subscription_created(
                            &email,
                            &name,
                            &plan.name,
                            plan.monthly_price_cents,
                            plan.monthly_credits,
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    async fn on_subscription_deleted(
        &self,
        conn: &mut PgConnection,
        envelope: &EventEnvelope,
        notifications: &mut Vec<Notification>,
    ) -> BillingResult<()> {
        let sub_obj: SubscriptionObject = serde_json::from_value(envelope.data.object.clone())
            .map_err(|e| BillingError::InvalidEvent(format!("subscription: {}", e)))?;

        let Some(local) = subscriptions::find_by_provider_id(conn, &sub_obj.id).await? else {
            return Ok(());
        };

        let canceled_at = sub_obj
            .canceled_at
            .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok());
        let status = sub_obj
            .status
            .clone()
            .unwrap_or_else(|| "canceled".to_string());

        subscriptions::mark_canceled(conn, local.id, &status, canceled_at).await?;
        audit::log_action(
            conn,
            local.owner_id,
            &format!(
                "Assinatura {} marcada inativa por evento do provedor de pagamento",
                local.id
            ),
        )
        .await;

        subscriptions::unlink_members(
            conn,
            local.id,
            &format!(
                "Vínculo removido devido ao cancelamento da assinatura {}",
                local.id
            ),
        )
        .await?;

        if let Some((email, name)) = owner_contact(conn, local.owner_id).await? {
            notifications.push(Notification::subscription_canceled(&email, &name, &sub_obj.id));
        }

        tracing::info!(
            subscription_id = local.id,
            provider_subscription_id = %sub_obj.id,
            "Subscription canceled, members unlinked"
        );
        Ok(())
    }

    async fn on_payment_succeeded(
        &self,
        conn: &mut PgConnection,
        envelope: &EventEnvelope,
        notifications: &mut Vec<Notification>,
    ) -> BillingResult<()> {
        let payment: PaymentObject = serde_json::from_value(envelope.data.object.clone())
            .map_err(|e| BillingError::InvalidEvent(format!("payment: {}", e)))?;

        let Some(payment_intent_id) = payment.payment_intent_id() else {
            tracing::debug!("Payment event without payment intent reference");
            return Ok(());
        };

        let Some(purchase) = purchases::find_by_payment_intent(conn, payment_intent_id).await?
        else {
            return Ok(());
        };

        if purchase.amount_paid_cents.unwrap_or(0) != 0 {
            return Ok(());
        }
        let Some(amount) = payment.amount_cents() else {
            return Ok(());
        };

        purchases::set_amount(conn, purchase.id, amount).await?;
        tracing::info!(purchase_id = purchase.id, amount_cents = amount, "Purchase reconciled");

        if let Some(user_id) = purchase.user_id {
            purchases::mark_user_purchased(conn, user_id).await?;
            if let Some(user) = find_user_by_id(conn, user_id).await? {
                notifications.push(Notification::payment_reconciled(
                    &user.email,
                    &user.name,
                    purchase.id,
                    amount,
                ));
            }
        }

        Ok(())
    }

    /// Resolve the local user a checkout session belongs to: metadata
    /// user id, then metadata/session email, then a best-effort
    /// provider customer-email lookup.
    async fn resolve_local_user(
        &self,
        conn: &mut PgConnection,
        session: &CheckoutSession,
    ) -> BillingResult<Option<User>> {
        if let Some(user_id) = meta_i64(&session.metadata, USER_ID_KEYS) {
            if let Some(user) = find_user_by_id(conn, user_id).await? {
                return Ok(Some(user));
            }
        }

        let email = meta_str(&session.metadata, USER_EMAIL_KEYS)
            .map(str::to_string)
            .or_else(|| {
                session
                    .customer_details
                    .as_ref()
                    .and_then(|details| details.email.clone())
            });
        if let Some(email) = email {
            if let Some(user) = find_user_by_email(conn, &email).await? {
                return Ok(Some(user));
            }
        }

        if let Some(customer) = &session.customer {
            match self.client.customer_email(customer.id()).await {
                Ok(Some(email)) => {
                    if let Some(user) = find_user_by_email(conn, &email).await? {
                        return Ok(Some(user));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        customer_id = %customer.id(),
                        error = %e,
                        "Could not retrieve provider customer"
                    );
                }
            }
        }

        Ok(None)
    }
}

async fn find_user_by_id(conn: &mut PgConnection, user_id: i64) -> BillingResult<Option<User>> {
    let user: Option<User> = sqlx::query_as(&format!(
        "SELECT {} FROM users WHERE id = $1",
        USER_COLUMNS
    ))
    .bind(user_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(user)
}

async fn find_user_by_email(conn: &mut PgConnection, email: &str) -> BillingResult<Option<User>> {
    let user: Option<User> = sqlx::query_as(&format!(
        "SELECT {} FROM users WHERE LOWER(email) = LOWER($1)",
        USER_COLUMNS
    ))
    .bind(email)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(user)
}

/// Email and display name of a subscription owner, for notifications
async fn owner_contact(
    conn: &mut PgConnection,
    owner_id: i64,
) -> BillingResult<Option<(String, String)>> {
    let contact: Option<(String, String)> =
        sqlx::query_as("SELECT email, name FROM users WHERE id = $1")
            .bind(owner_id)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(contact)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let signed_payload = format!("{}.{}", timestamp, payload);
        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let secret = "whsec_test_secret";
        let now = 1_700_000_000;
        let header = sign(payload, secret, now);
        assert!(verify_signature(payload, &header, secret, now).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let secret = "whsec_test_secret";
        let now = 1_700_000_000;
        let header = sign(r#"{"amount":100}"#, secret, now);
        let result = verify_signature(r#"{"amount":10000}"#, &header, secret, now);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = "{}";
        let secret = "whsec_test_secret";
        let signed_at = 1_700_000_000;
        let header = sign(payload, secret, signed_at);
        let result = verify_signature(payload, &header, secret, signed_at + 301);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_missing_signature_parts_rejected() {
        let result = verify_signature("{}", "t=123", "whsec_x", 123);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));

        let result = verify_signature("{}", "v1=abc", "whsec_x", 123);
        assert!(matches!(result, Err(BillingError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_ack_notes() {
        assert_eq!(Ack::Processed.note(), None);
        assert_eq!(Ack::Ignored.note(), Some("ignored_event_type"));
        assert_eq!(Ack::AlreadyProcessed.note(), Some("already_processed"));
    }
}
