//! Session context: the credential a coordinator authenticates with.
//!
//! A [`Session`] binds a [`SecretStore`] to a namespace. Each coordinator
//! holds its own session, so several coordinators (one per tenant, or one
//! per test) can run side by side without sharing tokens.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::model::CredentialType;
use crate::store::{Secret, SecretStore, StoreError};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The access/refresh token pair plus who it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: Secret,
    pub refresh_token: Option<Secret>,
    pub username: Option<String>,

    /// When the access token was last issued.
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl Credential {
    /// Create a credential with just an access token.
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: Secret::new(access_token),
            refresh_token: None,
            username: None,
            refreshed_at: Some(Utc::now()),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(refresh_token));
        self
    }

    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

/// Injectable holder of one credential.
///
/// Every read goes to the store, so callers always see the token written by
/// the most recent login or refresh.
#[derive(Clone)]
pub struct Session {
    store: Arc<dyn SecretStore>,
    namespace: String,
}

impl Session {
    pub fn new(store: Arc<dyn SecretStore>, namespace: impl Into<String>) -> Self {
        Self {
            store,
            namespace: namespace.into(),
        }
    }

    /// Session in the default namespace.
    pub fn with_store(store: Arc<dyn SecretStore>) -> Self {
        Self::new(store, DEFAULT_NAMESPACE)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Storage key for one credential component.
    pub fn key(&self, credential_type: CredentialType) -> String {
        format!("hydrant/{}/{}", self.namespace, credential_type)
    }

    async fn read(&self, credential_type: CredentialType) -> Result<Option<Secret>, StoreError> {
        self.store.get(&self.key(credential_type)).await
    }

    async fn write(&self, credential_type: CredentialType, value: &str) -> Result<(), StoreError> {
        self.store
            .set(&self.key(credential_type), &Secret::new(value))
            .await
    }

    pub async fn access_token(&self) -> Result<Option<Secret>, StoreError> {
        self.read(CredentialType::AccessToken).await
    }

    pub async fn refresh_token(&self) -> Result<Option<Secret>, StoreError> {
        self.read(CredentialType::RefreshToken).await
    }

    pub async fn username(&self) -> Result<Option<String>, StoreError> {
        Ok(self
            .read(CredentialType::Username)
            .await?
            .map(Secret::into_inner))
    }

    /// Load the full credential, or `None` when logged out.
    pub async fn credential(&self) -> Result<Option<Credential>, StoreError> {
        let Some(access_token) = self.access_token().await? else {
            return Ok(None);
        };

        // Unparseable timestamps are dropped rather than failing the load.
        let refreshed_at = self
            .read(CredentialType::RefreshedAt)
            .await?
            .and_then(|s| DateTime::parse_from_rfc3339(s.expose()).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(Some(Credential {
            access_token,
            refresh_token: self.refresh_token().await?,
            username: self.username().await?,
            refreshed_at,
        }))
    }

    /// Replace the whole credential.
    ///
    /// Components absent from `credential` are deleted so nothing from a
    /// previous login survives.
    pub async fn store_credential(&self, credential: &Credential) -> Result<(), StoreError> {
        self.write(CredentialType::AccessToken, credential.access_token.expose())
            .await?;

        match &credential.refresh_token {
            Some(token) => self.write(CredentialType::RefreshToken, token.expose()).await?,
            None => self.store.delete(&self.key(CredentialType::RefreshToken)).await?,
        }

        match &credential.username {
            Some(name) => self.write(CredentialType::Username, name).await?,
            None => self.store.delete(&self.key(CredentialType::Username)).await?,
        }

        let refreshed_at = credential.refreshed_at.unwrap_or_else(Utc::now);
        self.write(CredentialType::RefreshedAt, &refreshed_at.to_rfc3339())
            .await?;

        tracing::debug!(namespace = %self.namespace, "Stored credential");
        Ok(())
    }

    /// Persist a refreshed access token, optionally rotating the refresh token.
    pub async fn replace_access_token(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), StoreError> {
        self.write(CredentialType::AccessToken, access_token).await?;
        if let Some(refresh_token) = refresh_token {
            self.write(CredentialType::RefreshToken, refresh_token).await?;
        }
        self.write(CredentialType::RefreshedAt, &Utc::now().to_rfc3339())
            .await?;
        Ok(())
    }

    /// Delete every credential component.
    ///
    /// Attempts all deletes and reports the first failure.
    pub async fn clear(&self) -> Result<(), StoreError> {
        let mut first_error = None;
        for credential_type in CredentialType::ALL {
            if let Err(e) = self.store.delete(&self.key(credential_type)).await {
                first_error.get_or_insert(e);
            }
        }

        tracing::info!(namespace = %self.namespace, "Cleared session credentials");

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
