//! HMAC-SHA256 webhook signature verification for the messaging reply webhook.
//!
//! A tenant-scoped secret is optional: when none is configured for a tenant,
//! verification is skipped with a warning rather than rejected.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Resolves the per-tenant webhook secret. Concrete resolution against
/// organization settings is out of scope (§1); this crate ships an
/// environment-variable-backed default (`WF_WEBHOOK_SECRET__<tenantId>`).
pub trait TenantSecrets: Send + Sync {
    fn secret_for(&self, tenant_id: &str) -> Option<String>;
}

pub struct EnvTenantSecrets;

impl TenantSecrets for EnvTenantSecrets {
    fn secret_for(&self, tenant_id: &str) -> Option<String> {
        std::env::var(format!("WF_WEBHOOK_SECRET__{tenant_id}")).ok()
    }
}

/// Verifies `signature_hex` (lowercase hex HMAC-SHA256 of `raw_body` keyed by
/// `secret`). Returns `false` on mismatch or malformed hex.
pub fn verify(secret: &str, raw_body: &[u8], signature_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(raw_body);
    let Ok(provided) = hex::decode(signature_hex.trim_start_matches("sha256=")) else {
        return false;
    };
    mac.verify_slice(&provided).is_ok()
}
