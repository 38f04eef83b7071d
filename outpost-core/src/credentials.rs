//! Credential vault — encrypted OAuth token storage and refresh bookkeeping.
//!
//! Tokens are encrypted with the [`TokenCipher`] before they reach the store
//! and decrypted on the way out. Refresh itself is adapter-specific; the
//! vault persists refreshed tokens atomically and serializes concurrent
//! refreshes for the same `(tenant, connector)` through a KV lock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::encryption::TokenCipher;
use crate::error::CredentialError;
use crate::kv::{Kv, keys};
use crate::store::models::{ConnectorCredential, CredentialStatus};
use crate::store::Store;
use crate::types::{ChannelKind, TenantId};

/// Plaintext view of a stored credential, decrypted on demand.
#[derive(Debug, Clone)]
pub struct DecryptedCredential {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub account_ref: Option<String>,
    pub status: CredentialStatus,
}

pub struct CredentialVault {
    store: Arc<dyn Store>,
    kv: Arc<dyn Kv>,
    cipher: TokenCipher,
}

const REFRESH_LOCK_TTL: Duration = Duration::from_secs(30);

impl CredentialVault {
    pub fn new(store: Arc<dyn Store>, kv: Arc<dyn Kv>, cipher: TokenCipher) -> Self {
        Self { store, kv, cipher }
    }

    pub fn get(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
    ) -> Result<Option<ConnectorCredential>, CredentialError> {
        Ok(self.store.connector_credential(tenant_id, connector)?)
    }

    /// Decrypt the stored token set for adapter use.
    pub fn decrypted(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
    ) -> Result<Option<DecryptedCredential>, CredentialError> {
        let Some(credential) = self.get(tenant_id, connector)? else {
            return Ok(None);
        };
        let access_token = credential
            .encrypted_access_token
            .as_deref()
            .map(|t| self.cipher.decrypt(t))
            .transpose()?;
        let refresh_token = credential
            .encrypted_refresh_token
            .as_deref()
            .map(|t| self.cipher.decrypt(t))
            .transpose()?;
        Ok(Some(DecryptedCredential {
            access_token,
            refresh_token,
            expires_at: credential.expires_at,
            scopes: credential.scopes,
            account_ref: credential.account_ref,
            status: credential.status,
        }))
    }

    /// Encrypt and persist a token set. `None` token fields keep the
    /// previously stored ciphertext.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
        scopes: Vec<String>,
        account_ref: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), CredentialError> {
        let existing = self.get(tenant_id, connector)?;
        let encrypted_access_token = match access_token {
            Some(token) => Some(self.cipher.encrypt(token)?),
            None => existing.as_ref().and_then(|c| c.encrypted_access_token.clone()),
        };
        let encrypted_refresh_token = match refresh_token {
            Some(token) => Some(self.cipher.encrypt(token)?),
            None => existing.as_ref().and_then(|c| c.encrypted_refresh_token.clone()),
        };
        let expires_at = expires_at.or(existing.as_ref().and_then(|c| c.expires_at));
        let account_ref = account_ref
            .map(ToString::to_string)
            .or(existing.as_ref().and_then(|c| c.account_ref.clone()));
        let scopes = if scopes.is_empty() {
            existing.map(|c| c.scopes).unwrap_or_default()
        } else {
            scopes
        };
        self.store.upsert_connector_credential(&ConnectorCredential {
            tenant_id,
            connector,
            encrypted_access_token,
            encrypted_refresh_token,
            expires_at,
            scopes,
            account_ref,
            status: CredentialStatus::Active,
            last_error: None,
            updated_at: now,
        })?;
        Ok(())
    }

    pub fn mark_error(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
        message: &str,
        status: CredentialStatus,
        now: DateTime<Utc>,
    ) -> Result<(), CredentialError> {
        self.store
            .set_credential_status(tenant_id, connector, status, Some(message), now)?;
        Ok(())
    }

    pub fn revoke(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
        now: DateTime<Utc>,
    ) -> Result<(), CredentialError> {
        self.store
            .set_credential_status(tenant_id, connector, CredentialStatus::Revoked, None, now)?;
        Ok(())
    }

    pub fn is_revoked(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
    ) -> Result<bool, CredentialError> {
        Ok(self
            .get(tenant_id, connector)?
            .map(|c| c.status == CredentialStatus::Revoked)
            .unwrap_or(false))
    }

    pub fn is_expiring(
        &self,
        tenant_id: TenantId,
        connector: ChannelKind,
        within: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, CredentialError> {
        let Some(credential) = self.get(tenant_id, connector)? else {
            return Ok(false);
        };
        let Some(expires_at) = credential.expires_at else {
            return Ok(false);
        };
        Ok(expires_at <= now + chrono::Duration::from_std(within).unwrap_or_default())
    }

    /// Take the per-(tenant, connector) refresh lock. Returns false when
    /// another worker is refreshing; callers should re-read the credential
    /// instead of refreshing again.
    pub fn try_lock_refresh(&self, tenant_id: TenantId, connector: ChannelKind) -> bool {
        self.kv
            .set_nx_ex(
                &keys::credential_refresh_lock(tenant_id, connector.as_str()),
                "1",
                REFRESH_LOCK_TTL,
            )
            .unwrap_or(true)
    }

    pub fn unlock_refresh(&self, tenant_id: TenantId, connector: ChannelKind) {
        let _ = self
            .kv
            .delete(&keys::credential_refresh_lock(tenant_id, connector.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::kv::MemoryKv;
    use crate::store::MemoryStore;
    use chrono::TimeZone;

    fn vault() -> (CredentialVault, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap(),
        ));
        let store = Arc::new(MemoryStore::new());
        let kv = Arc::new(MemoryKv::new(clock.clone()));
        (
            CredentialVault::new(store, kv, TokenCipher::from_secret("vault-test")),
            clock,
        )
    }

    #[test]
    fn test_tokens_encrypted_at_rest() {
        let (vault, clock) = vault();
        let tenant = TenantId::new();
        vault
            .upsert(
                tenant,
                ChannelKind::LinkedIn,
                Some("access-plain"),
                Some("refresh-plain"),
                None,
                vec!["w_member_social".into()],
                Some("member-123"),
                clock.now(),
            )
            .unwrap();

        let stored = vault.get(tenant, ChannelKind::LinkedIn).unwrap().unwrap();
        assert_ne!(stored.encrypted_access_token.as_deref(), Some("access-plain"));
        assert_ne!(stored.encrypted_refresh_token.as_deref(), Some("refresh-plain"));

        let decrypted = vault.decrypted(tenant, ChannelKind::LinkedIn).unwrap().unwrap();
        assert_eq!(decrypted.access_token.as_deref(), Some("access-plain"));
        assert_eq!(decrypted.refresh_token.as_deref(), Some("refresh-plain"));
        assert_eq!(decrypted.scopes, vec!["w_member_social".to_string()]);
    }

    #[test]
    fn test_partial_upsert_keeps_existing_tokens() {
        let (vault, clock) = vault();
        let tenant = TenantId::new();
        vault
            .upsert(
                tenant,
                ChannelKind::X,
                Some("access-1"),
                Some("refresh-1"),
                None,
                vec![],
                None,
                clock.now(),
            )
            .unwrap();
        // Refresh rotated only the access token.
        vault
            .upsert(tenant, ChannelKind::X, Some("access-2"), None, None, vec![], None, clock.now())
            .unwrap();

        let decrypted = vault.decrypted(tenant, ChannelKind::X).unwrap().unwrap();
        assert_eq!(decrypted.access_token.as_deref(), Some("access-2"));
        assert_eq!(decrypted.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[test]
    fn test_revoke_and_mark_error() {
        let (vault, clock) = vault();
        let tenant = TenantId::new();
        vault
            .upsert(tenant, ChannelKind::Facebook, Some("t"), None, None, vec![], None, clock.now())
            .unwrap();
        assert!(!vault.is_revoked(tenant, ChannelKind::Facebook).unwrap());

        vault
            .mark_error(
                tenant,
                ChannelKind::Facebook,
                "Graph API 190: token invalid",
                CredentialStatus::Error,
                clock.now(),
            )
            .unwrap();
        let stored = vault.get(tenant, ChannelKind::Facebook).unwrap().unwrap();
        assert_eq!(stored.status, CredentialStatus::Error);
        assert!(stored.last_error.unwrap().contains("190"));

        vault.revoke(tenant, ChannelKind::Facebook, clock.now()).unwrap();
        assert!(vault.is_revoked(tenant, ChannelKind::Facebook).unwrap());
    }

    #[test]
    fn test_is_expiring_window() {
        let (vault, clock) = vault();
        let tenant = TenantId::new();
        let expires_at = clock.now() + chrono::Duration::seconds(45);
        vault
            .upsert(
                tenant,
                ChannelKind::Instagram,
                Some("t"),
                None,
                Some(expires_at),
                vec![],
                None,
                clock.now(),
            )
            .unwrap();

        assert!(vault
            .is_expiring(tenant, ChannelKind::Instagram, Duration::from_secs(60), clock.now())
            .unwrap());
        assert!(!vault
            .is_expiring(tenant, ChannelKind::Instagram, Duration::from_secs(10), clock.now())
            .unwrap());
    }

    #[test]
    fn test_refresh_lock_serializes() {
        let (vault, _) = vault();
        let tenant = TenantId::new();
        assert!(vault.try_lock_refresh(tenant, ChannelKind::TikTok));
        assert!(!vault.try_lock_refresh(tenant, ChannelKind::TikTok));
        vault.unlock_refresh(tenant, ChannelKind::TikTok);
        assert!(vault.try_lock_refresh(tenant, ChannelKind::TikTok));
    }

    #[test]
    fn test_missing_credential_reads() {
        let (vault, clock) = vault();
        let tenant = TenantId::new();
        assert!(vault.get(tenant, ChannelKind::Threads).unwrap().is_none());
        assert!(vault.decrypted(tenant, ChannelKind::Threads).unwrap().is_none());
        assert!(!vault.is_revoked(tenant, ChannelKind::Threads).unwrap());
        assert!(!vault
            .is_expiring(tenant, ChannelKind::Threads, Duration::from_secs(60), clock.now())
            .unwrap());
    }
}
