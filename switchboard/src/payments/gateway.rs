use anyhow::Context;
use anyhow::Result;
use hmac::Hmac;
use hmac::Mac;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_API_BASE: &str = "https://api.stripe.com";

/// What a checkout link is buying, carried as metadata and echoed back by
/// the processor on `checkout completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckoutKind {
    Initial,
    Extension,
    PayoutCollection,
}

impl CheckoutKind {
    fn as_str(&self) -> &'static str {
        match self {
            CheckoutKind::Initial => "initial",
            CheckoutKind::Extension => "extension",
            CheckoutKind::PayoutCollection => "payout_collection",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "initial" => Some(CheckoutKind::Initial),
            "extension" => Some(CheckoutKind::Extension),
            "payout_collection" => Some(CheckoutKind::PayoutCollection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutMetadata {
    pub kind: CheckoutKind,
    pub purchase_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub transfer_ref: Option<String>,
}

impl CheckoutMetadata {
    pub fn initial(purchase_id: Uuid) -> Self {
        Self {
            kind: CheckoutKind::Initial,
            purchase_id: Some(purchase_id),
            session_id: None,
            transfer_ref: None,
        }
    }

    pub fn extension(purchase_id: Uuid, session_id: Uuid) -> Self {
        Self {
            kind: CheckoutKind::Extension,
            purchase_id: Some(purchase_id),
            session_id: Some(session_id),
            transfer_ref: None,
        }
    }

    pub fn payout_collection(transfer_ref: String) -> Self {
        Self {
            kind: CheckoutKind::PayoutCollection,
            purchase_id: None,
            session_id: None,
            transfer_ref: Some(transfer_ref),
        }
    }

    /// Flattened `metadata[...]` form fields for the processor API.
    pub fn form_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![("metadata[kind]".to_string(), self.kind.as_str().to_string())];
        if let Some(purchase_id) = self.purchase_id {
            fields.push(("metadata[purchase_id]".to_string(), purchase_id.to_string()));
        }
        if let Some(session_id) = self.session_id {
            fields.push(("metadata[session_id]".to_string(), session_id.to_string()));
        }
        if let Some(transfer_ref) = &self.transfer_ref {
            fields.push(("metadata[transfer_ref]".to_string(), transfer_ref.clone()));
        }
        fields
    }

    /// Read the metadata back out of a webhook event object. `None` when
    /// the object carries no recognizable kind tag (not one of ours).
    pub fn from_object(object: &serde_json::Value) -> Option<Self> {
        let metadata = object.get("metadata")?;
        let kind = CheckoutKind::parse(metadata.get("kind")?.as_str()?)?;

        let parse_uuid = |key: &str| {
            metadata
                .get(key)
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
        };

        Some(Self {
            kind,
            purchase_id: parse_uuid("purchase_id"),
            session_id: parse_uuid("session_id"),
            transfer_ref: metadata
                .get("transfer_ref")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct CheckoutLink {
    /// The processor's id for the hosted checkout session.
    pub checkout_ref: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct RefundReceipt {
    pub refund_ref: String,
}

/// Outbound interface to the external payment processor. The engine never
/// talks to the processor directly; everything goes through this seam.
#[axum::async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_checkout(
        &self,
        amount: Decimal,
        description: &str,
        metadata: &CheckoutMetadata,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutLink>;

    async fn refund(&self, external_payment_ref: &str, reason: &str) -> Result<RefundReceipt>;

    /// Push collected payout money towards the listener. Completion is
    /// reported asynchronously via the webhook (`kind=payout_collection`).
    async fn transfer(&self, amount: Decimal, transfer_ref: &str, description: &str)
        -> Result<String>;
}

/// Hosted-checkout processor client speaking the Stripe wire protocol.
pub struct HostedCheckoutGateway {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl HostedCheckoutGateway {
    pub fn new(api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }

    pub fn with_api_base(api_key: String, api_base: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
            api_base,
        }
    }
}

#[derive(Deserialize)]
struct CheckoutSessionResponse {
    id: String,
    url: String,
}

#[derive(Deserialize)]
struct RefundResponse {
    id: String,
}

#[derive(Deserialize)]
struct TransferResponse {
    id: String,
}

#[axum::async_trait]
impl PaymentGateway for HostedCheckoutGateway {
    async fn create_checkout(
        &self,
        amount: Decimal,
        description: &str,
        metadata: &CheckoutMetadata,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutLink> {
        let mut form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), success_url.to_string()),
            ("cancel_url".to_string(), cancel_url.to_string()),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
            (
                "line_items[0][price_data][currency]".to_string(),
                "usd".to_string(),
            ),
            (
                "line_items[0][price_data][unit_amount]".to_string(),
                amount_to_cents(amount)?.to_string(),
            ),
            (
                "line_items[0][price_data][product_data][name]".to_string(),
                description.to_string(),
            ),
        ];
        form.extend(metadata.form_fields());

        let response: CheckoutSessionResponse = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.api_key)
            .form(&form)
            .send()
            .await
            .context("Checkout request failed")?
            .error_for_status()
            .context("Checkout request rejected")?
            .json()
            .await
            .context("Malformed checkout response")?;

        Ok(CheckoutLink {
            checkout_ref: response.id,
            url: response.url,
        })
    }

    async fn refund(&self, external_payment_ref: &str, reason: &str) -> Result<RefundReceipt> {
        let form = vec![
            ("payment_intent".to_string(), external_payment_ref.to_string()),
            ("metadata[reason]".to_string(), reason.to_string()),
        ];

        let response: RefundResponse = self
            .client
            .post(format!("{}/v1/refunds", self.api_base))
            .bearer_auth(&self.api_key)
            .form(&form)
            .send()
            .await
            .context("Refund request failed")?
            .error_for_status()
            .context("Refund request rejected")?
            .json()
            .await
            .context("Malformed refund response")?;

        Ok(RefundReceipt {
            refund_ref: response.id,
        })
    }

    async fn transfer(
        &self,
        amount: Decimal,
        transfer_ref: &str,
        description: &str,
    ) -> Result<String> {
        let form = vec![
            ("amount".to_string(), amount_to_cents(amount)?.to_string()),
            ("currency".to_string(), "usd".to_string()),
            ("transfer_group".to_string(), transfer_ref.to_string()),
            ("description".to_string(), description.to_string()),
            (
                "metadata[kind]".to_string(),
                CheckoutKind::PayoutCollection.as_str().to_string(),
            ),
            ("metadata[transfer_ref]".to_string(), transfer_ref.to_string()),
        ];

        let response: TransferResponse = self
            .client
            .post(format!("{}/v1/transfers", self.api_base))
            .bearer_auth(&self.api_key)
            .form(&form)
            .send()
            .await
            .context("Transfer request failed")?
            .error_for_status()
            .context("Transfer request rejected")?
            .json()
            .await
            .context("Malformed transfer response")?;

        Ok(response.id)
    }
}

fn amount_to_cents(amount: Decimal) -> Result<i64> {
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .context("Amount does not fit into cents")
}

#[derive(Error, Debug, PartialEq)]
pub enum SignatureError {
    #[error("Malformed signature header")]
    Malformed,
    #[error("Signature mismatch")]
    BadSignature,
}

/// Produce the `t=<timestamp>,v1=<hex hmac>` header value for a payload.
/// The counterpart of [`verify_webhook_signature`]; also used to fabricate
/// events in tests.
pub fn sign_webhook_payload(secret: &str, timestamp: i64, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length to work");
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    let signature = hex::encode(mac.finalize().into_bytes());
    format!("t={timestamp},v1={signature}")
}

/// Verify a webhook body against its signature header. Constant-time
/// comparison via the MAC itself.
pub fn verify_webhook_signature(
    secret: &str,
    payload: &str,
    header: &str,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signature = hex::decode(value).ok(),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    let signature = signature.ok_or(SignatureError::Malformed)?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length to work");
    mac.update(format!("{timestamp}.{payload}").as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| SignatureError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn metadata_round_trips_through_an_event_object() {
        let purchase_id = Uuid::new_v4();
        let session_id = Uuid::new_v4();
        let metadata = CheckoutMetadata::extension(purchase_id, session_id);

        let object = serde_json::json!({
            "id": "cs_test_123",
            "metadata": {
                "kind": "extension",
                "purchase_id": purchase_id.to_string(),
                "session_id": session_id.to_string(),
            }
        });

        assert_eq!(CheckoutMetadata::from_object(&object), Some(metadata));
    }

    #[test]
    fn foreign_event_objects_produce_no_metadata() {
        let object = serde_json::json!({
            "id": "cs_test_123",
            "metadata": { "shop_order": "1234" }
        });
        assert_eq!(CheckoutMetadata::from_object(&object), None);

        let no_metadata = serde_json::json!({ "id": "cs_test_123" });
        assert_eq!(CheckoutMetadata::from_object(&no_metadata), None);
    }

    #[test]
    fn amounts_convert_to_cents_exactly() {
        assert_eq!(amount_to_cents(dec!(20.00)).unwrap(), 2000);
        assert_eq!(amount_to_cents(dec!(9.99)).unwrap(), 999);
        assert_eq!(amount_to_cents(dec!(0.01)).unwrap(), 1);
    }

    #[test]
    fn signed_payloads_verify() {
        let payload = r#"{"type":"checkout.session.completed"}"#;
        let header = sign_webhook_payload("whsec_test", 1_750_000_000, payload);

        assert_eq!(
            verify_webhook_signature("whsec_test", payload, &header),
            Ok(())
        );
    }

    #[test]
    fn tampered_payloads_are_rejected() {
        let header = sign_webhook_payload("whsec_test", 1_750_000_000, "original body");

        assert_eq!(
            verify_webhook_signature("whsec_test", "tampered body", &header),
            Err(SignatureError::BadSignature)
        );
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = "body";
        let header = sign_webhook_payload("whsec_a", 1_750_000_000, payload);

        assert_eq!(
            verify_webhook_signature("whsec_b", payload, &header),
            Err(SignatureError::BadSignature)
        );
    }

    #[test]
    fn header_without_signature_parts_is_malformed() {
        assert_eq!(
            verify_webhook_signature("whsec_test", "body", "t=123"),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_webhook_signature("whsec_test", "body", "nonsense"),
            Err(SignatureError::Malformed)
        );
    }
}
