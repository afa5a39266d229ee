use crate::infrastructure::error::InfraError;
use std::sync::Mutex;

/// Storage for the bearer token presented to the remote store.
pub trait CredentialStore: Send + Sync {
    fn save_token(&self, token: &str) -> Result<(), InfraError>;
    fn load_token(&self) -> Result<Option<String>, InfraError>;
    fn delete_token(&self) -> Result<(), InfraError>;
}

#[derive(Debug, Clone)]
pub struct KeyringCredentialStore {
    service_name: String,
    account_name: String,
}

impl KeyringCredentialStore {
    pub fn new(service_name: impl Into<String>, account_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            account_name: account_name.into(),
        }
    }

    fn entry(&self) -> Result<keyring::Entry, InfraError> {
        keyring::Entry::new(&self.service_name, &self.account_name)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }
}

impl Default for KeyringCredentialStore {
    fn default() -> Self {
        Self::new("worktime.remote", "default")
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn save_token(&self, token: &str) -> Result<(), InfraError> {
        let token = normalize_token(token)?;
        self.entry()?
            .set_password(token)
            .map_err(|error| InfraError::Credential(error.to_string()))
    }

    fn load_token(&self) -> Result<Option<String>, InfraError> {
        match self.entry()?.get_password() {
            Ok(value) => Ok(Some(value).filter(|token| !token.trim().is_empty())),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }

    fn delete_token(&self) -> Result<(), InfraError> {
        match self.entry()?.delete_credential() {
            Ok(_) => Ok(()),
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(error) => Err(InfraError::Credential(error.to_string())),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCredentialStore {
    token: Mutex<Option<String>>,
}

impl InMemoryCredentialStore {
    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Option<String>>, InfraError> {
        self.token
            .lock()
            .map_err(|error| InfraError::Credential(format!("in-memory lock poisoned: {error}")))
    }
}

impl CredentialStore for InMemoryCredentialStore {
    fn save_token(&self, token: &str) -> Result<(), InfraError> {
        let token = normalize_token(token)?;
        *self.lock()? = Some(token.to_string());
        Ok(())
    }

    fn load_token(&self) -> Result<Option<String>, InfraError> {
        Ok(self.lock()?.clone())
    }

    fn delete_token(&self) -> Result<(), InfraError> {
        *self.lock()? = None;
        Ok(())
    }
}

/// Environment override first, then the stored token.
pub fn resolve_token(
    token_override: Option<&str>,
    store: &dyn CredentialStore,
) -> Result<Option<String>, InfraError> {
    if let Some(token) = token_override.map(str::trim).filter(|token| !token.is_empty()) {
        return Ok(Some(token.to_string()));
    }
    store.load_token()
}

fn normalize_token(token: &str) -> Result<&str, InfraError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(InfraError::Credential("token must not be empty".to_string()));
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_store_saves_and_clears() {
        let store = InMemoryCredentialStore::default();
        assert_eq!(store.load_token().expect("load"), None);

        store.save_token("  abc123 ").expect("save");
        assert_eq!(store.load_token().expect("load").as_deref(), Some("abc123"));

        store.delete_token().expect("delete");
        assert_eq!(store.load_token().expect("load"), None);
        assert!(store.save_token("   ").is_err());
    }

    #[test]
    fn environment_token_wins_over_stored_token() {
        let store = InMemoryCredentialStore::default();
        store.save_token("stored").expect("save");

        assert_eq!(
            resolve_token(Some("from-env"), &store).expect("resolve").as_deref(),
            Some("from-env")
        );
        assert_eq!(resolve_token(Some("  "), &store).expect("resolve").as_deref(), Some("stored"));
        assert_eq!(resolve_token(None, &store).expect("resolve").as_deref(), Some("stored"));
    }
}
