#![deny(missing_docs)]

//! External financial-provider client trait and webhook verification
//! (`spec.md` §6, component P).
//!
//! One `#[async_trait]` trait any provider (Plaid, a card processor, an
//! invoicing API) implements, plus an HMAC-SHA256-over-`{timestamp}.{body}`
//! verifier shared by every concrete client. `spec.md` §6 only requires a
//! stub that accepts every webhook — `PLAID_USE_STUB` defaults to true and
//! nothing in this pilot calls a live provider API, so there is no HTTP
//! client here; a real client would add one when it has somewhere to point.

use async_trait::async_trait;
use fh_types::FhError;
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;

type HmacSha256 = Hmac<Sha256>;

/// Result of [`ProviderClient::verify_webhook`] (`spec.md` §6:
/// `VerifyWebhook(headers, body) -> {ok, reason}`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyResult {
    /// Whether the signature/payload checked out.
    pub ok: bool,
    /// Set when `ok` is `false`.
    pub reason: Option<String>,
}

impl VerifyResult {
    /// Successful verification.
    #[must_use]
    pub fn ok() -> Self {
        Self { ok: true, reason: None }
    }

    /// Failed verification with a stable, loggable reason.
    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self { ok: false, reason: Some(reason.into()) }
    }
}

/// A sandboxed link-token/exchange/sync handshake with an external
/// financial provider. Every method is a thin wrapper the core calls
/// through; concrete errors are surfaced as `FhError::Provider`.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Stable provider name, e.g. `"plaid"`.
    fn name(&self) -> &'static str;

    /// `POST /integrations/{provider}/link_token/{business_id}`: returns an
    /// opaque token the caller hands to the provider's client-side widget.
    async fn create_link_token(&self, business_id: &str) -> Result<String, FhError>;

    /// `POST /integrations/{provider}/exchange/{business_id}`: exchanges a
    /// public token (minted by the provider's client widget) for a durable
    /// access token. The core never logs the returned token.
    async fn exchange_public_token(&self, business_id: &str, public_token: &str) -> Result<String, FhError>;

    /// `POST /integrations/{provider}/sync/{business_id}`: pulls the
    /// provider's latest transaction feed as raw JSON payloads, one per
    /// `RawEvent` to ingest.
    async fn sync(&self, business_id: &str, access_token: &str, cursor: Option<&str>) -> Result<SyncPage, FhError>;

    /// `VerifyWebhook(headers, body)`: must succeed before the core passes
    /// a webhook payload to ingest (`spec.md` §6).
    fn verify_webhook(&self, headers: &HashMap<String, String>, body: &[u8]) -> VerifyResult;
}

/// One page of [`ProviderClient::sync`] results.
#[derive(Debug, Clone)]
pub struct SyncPage {
    /// Raw provider payloads, newest-unknown-first is not guaranteed —
    /// `fh-raw-events::RawEventRepo::insert` is idempotent per
    /// `source_event_id` regardless of order.
    pub events: Vec<Value>,
    /// Opaque cursor to pass as `cursor` on the next call; `None` once the
    /// provider has nothing further to page through.
    pub next_cursor: Option<String>,
    /// Whether the provider reported this business's connection as healthy.
    pub connected: bool,
}

/// Accepts every sync/exchange/webhook call. `spec.md` §6: "Stub providers
/// accept all." Used whenever `PLAID_USE_STUB` (or the equivalent flag for
/// another provider) is set, which is the pilot's default.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubProviderClient;

#[async_trait]
impl ProviderClient for StubProviderClient {
    fn name(&self) -> &'static str {
        "stub"
    }

    async fn create_link_token(&self, business_id: &str) -> Result<String, FhError> {
        Ok(format!("link-stub-{business_id}"))
    }

    async fn exchange_public_token(&self, business_id: &str, _public_token: &str) -> Result<String, FhError> {
        Ok(format!("access-stub-{business_id}"))
    }

    async fn sync(&self, _business_id: &str, _access_token: &str, _cursor: Option<&str>) -> Result<SyncPage, FhError> {
        Ok(SyncPage { events: Vec::new(), next_cursor: None, connected: true })
    }

    fn verify_webhook(&self, _headers: &HashMap<String, String>, _body: &[u8]) -> VerifyResult {
        VerifyResult::ok()
    }
}

/// Verifies a Plaid-shaped webhook signature: header carries
/// `t={timestamp},v1={hex_hmac}`, the signed string is
/// `"{timestamp}.{body}"`, HMAC-SHA256 keyed by the webhook secret. Same
/// construction as `StripeClient::verify_webhook_signature`, generalized to
/// take the secret and header name as configuration instead of being
/// Stripe-specific.
pub struct HmacWebhookVerifier {
    webhook_secret: String,
    signature_header: &'static str,
}

impl HmacWebhookVerifier {
    /// `signature_header` is the HTTP header carrying `t=...,v1=...`
    /// (`"Plaid-Verification"` for Plaid).
    #[must_use]
    pub fn new(webhook_secret: impl Into<String>, signature_header: &'static str) -> Self {
        Self { webhook_secret: webhook_secret.into(), signature_header }
    }

    /// Parse `t=...,v1=...` and check the HMAC. Pure; takes the header
    /// value directly so it is independently testable without an HTTP type.
    #[must_use]
    pub fn verify(&self, header_value: &str, body: &[u8]) -> VerifyResult {
        let mut timestamp = None;
        let mut signature = None;
        for part in header_value.split(',') {
            if let Some(rest) = part.strip_prefix("t=") {
                timestamp = Some(rest);
            } else if let Some(rest) = part.strip_prefix("v1=") {
                signature = Some(rest);
            }
        }
        let (Some(timestamp), Some(expected)) = (timestamp, signature) else {
            return VerifyResult::failed("malformed signature header");
        };

        let signed_payload = format!("{timestamp}.{}", String::from_utf8_lossy(body));
        let Ok(mut mac) = HmacSha256::new_from_slice(self.webhook_secret.as_bytes()) else {
            return VerifyResult::failed("invalid webhook secret");
        };
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed == expected {
            VerifyResult::ok()
        } else {
            VerifyResult::failed("signature mismatch")
        }
    }

    /// Look up [`Self::signature_header`] in a header map and verify it;
    /// missing header is itself a failed verification.
    #[must_use]
    pub fn verify_headers(&self, headers: &HashMap<String, String>, body: &[u8]) -> VerifyResult {
        match headers.get(self.signature_header) {
            Some(value) => self.verify(value, body),
            None => VerifyResult::failed(format!("missing {} header", self.signature_header)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, timestamp: &str, body: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{body}").as_bytes());
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn verifies_matching_signature() {
        let verifier = HmacWebhookVerifier::new("shh", "Plaid-Verification");
        let header = sign("shh", "1700000000", "{\"a\":1}");
        let result = verifier.verify(&header, b"{\"a\":1}");
        assert!(result.ok);
    }

    #[test]
    fn rejects_tampered_body() {
        let verifier = HmacWebhookVerifier::new("shh", "Plaid-Verification");
        let header = sign("shh", "1700000000", "{\"a\":1}");
        let result = verifier.verify(&header, b"{\"a\":2}");
        assert!(!result.ok);
        assert_eq!(result.reason.as_deref(), Some("signature mismatch"));
    }

    #[test]
    fn rejects_malformed_header() {
        let verifier = HmacWebhookVerifier::new("shh", "Plaid-Verification");
        let result = verifier.verify("not-a-valid-header", b"{}");
        assert!(!result.ok);
    }

    #[test]
    fn stub_accepts_everything() {
        let stub = StubProviderClient;
        assert!(stub.verify_webhook(&HashMap::new(), b"anything").ok);
    }
}
