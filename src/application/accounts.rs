use crate::application::clock::Clock;
use crate::application::sync_engine::{PassReport, SyncTarget};
use crate::domain::merge::{merge_last_write, reconcile_accounts};
use crate::domain::models::{AccountDirectory, OneTimeCode, UserAccount};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::local_store::JsonFileStore;
use crate::infrastructure::remote_store::{RemoteStore, RemoteTarget};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

const ACCOUNTS_FILE: &str = "users.json";
const AUTO_LOGIN_FILE: &str = "auto_login.json";
const MAX_USERNAME_LENGTH: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct AutoLogin {
    #[serde(default)]
    username: Option<String>,
}

pub fn hash_password(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// Usernames double as directory names and remote keys.
pub fn validate_username(username: &str) -> Result<&str, InfraError> {
    let username = username.trim();
    let invalid = username.is_empty()
        || username.len() > MAX_USERNAME_LENGTH
        || username.starts_with('.')
        || username
            .chars()
            .any(|character| matches!(character, '/' | '\\' | ':') || character.is_control());
    if invalid {
        return Err(InfraError::InvalidState(format!("invalid username '{username}'")));
    }
    Ok(username)
}

/// Local account directory plus the logged-in identity.
pub struct AccountService {
    store: JsonFileStore<AccountDirectory>,
    directory: Mutex<AccountDirectory>,
    auto_login: JsonFileStore<AutoLogin>,
    remote: RemoteTarget<UserAccount>,
    /// Accounts mutated locally and not yet uploaded.
    dirty: Mutex<BTreeSet<String>>,
    clock: Clock,
}

impl AccountService {
    pub fn open(data_dir: &Path, remote: RemoteTarget<UserAccount>, clock: Clock) -> Self {
        let store: JsonFileStore<AccountDirectory> = JsonFileStore::new(data_dir.join(ACCOUNTS_FILE));
        let directory = store.load();
        Self {
            store,
            directory: Mutex::new(directory),
            auto_login: JsonFileStore::new(data_dir.join(AUTO_LOGIN_FILE)),
            remote,
            dirty: Mutex::new(BTreeSet::new()),
            clock,
        }
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub fn directory(&self) -> Result<AccountDirectory, InfraError> {
        Ok(self.lock_directory()?.clone())
    }

    pub fn account(&self, username: &str) -> Result<Option<UserAccount>, InfraError> {
        Ok(self.lock_directory()?.get(username).cloned())
    }

    /// Rejects names already known locally or on a reachable remote. An
    /// unreachable remote does not block offline registration.
    pub async fn register(&self, username: &str, password: &str) -> Result<UserAccount, InfraError> {
        let username = validate_username(username)?;
        if password.is_empty() {
            return Err(InfraError::InvalidState("password must not be empty".to_string()));
        }
        if self.lock_directory()?.contains(username) {
            return Err(InfraError::AccountExists(username.to_string()));
        }
        if self.fetch_remote(username).await.is_some() {
            return Err(InfraError::AccountExists(username.to_string()));
        }

        let account = UserAccount::new(username, hash_password(password), self.clock.now());
        self.store_account(account.clone())?;
        tracing::info!(username, "account registered");
        Ok(account)
    }

    /// Local directory first, remote as fallback for accounts created on
    /// another device.
    pub async fn login(&self, username: &str, password: &str) -> Result<UserAccount, InfraError> {
        let username = validate_username(username)?;
        let mut account = self.find_account(username).await?;
        let supplied = hash_password(password);

        if !account.has_password() {
            tracing::info!(username, "legacy account adopts the supplied password");
            account.password_hash = supplied;
        } else if account.password_hash != supplied {
            return Err(InfraError::InvalidCredentials);
        }
        self.complete_login(account)
    }

    /// Logs in the identity bound to a one-time code.
    pub async fn login_with_code(&self, code: &mut OneTimeCode, input: &str) -> Result<UserAccount, InfraError> {
        if !code.redeem(input, self.clock.now()) {
            return Err(InfraError::InvalidCredentials);
        }
        let username = validate_username(&code.identity)?.to_string();
        let account = self.find_account(&username).await?;
        self.complete_login(account)
    }

    /// The remembered user, if their account is still known locally.
    pub fn auto_login(&self) -> Result<Option<String>, InfraError> {
        let Some(username) = self.auto_login.load().username else {
            return Ok(None);
        };
        if self.lock_directory()?.contains(&username) {
            Ok(Some(username))
        } else {
            tracing::warn!(username = %username, "auto-login refers to an unknown account");
            Ok(None)
        }
    }

    pub fn logout(&self) -> Result<(), InfraError> {
        match fs::remove_file(self.auto_login.path()) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    pub fn current_user(&self) -> Result<String, InfraError> {
        self.auto_login()?.ok_or(InfraError::NotLoggedIn)
    }

    async fn find_account(&self, username: &str) -> Result<UserAccount, InfraError> {
        if let Some(account) = self.account(username)? {
            return Ok(account);
        }
        self.fetch_remote(username)
            .await
            .ok_or_else(|| InfraError::UnknownAccount(username.to_string()))
    }

    async fn fetch_remote(&self, username: &str) -> Option<UserAccount> {
        let RemoteTarget::Configured(remote) = &self.remote else {
            return None;
        };
        match remote.get(username).await {
            Ok(account) => account,
            Err(error) => {
                tracing::warn!(username, %error, "remote account lookup failed; continuing offline");
                None
            }
        }
    }

    fn complete_login(&self, mut account: UserAccount) -> Result<UserAccount, InfraError> {
        let now = self.clock.now();
        account.last_login = Some(now);
        account.last_sync = Some(now);
        self.store_account(account.clone())?;
        self.auto_login.save(&AutoLogin {
            username: Some(account.username.clone()),
        })?;
        tracing::info!(username = %account.username, "logged in");
        Ok(account)
    }

    fn store_account(&self, account: UserAccount) -> Result<(), InfraError> {
        let username = account.username.clone();
        let mut directory = self.lock_directory()?;
        directory.upsert(account);
        self.store.save(&directory)?;
        drop(directory);
        self.lock_dirty()?.insert(username);
        Ok(())
    }

    /// Applies accounts pulled by a sync pass, re-checking each against the
    /// current directory in case it changed while the pass was remote.
    fn adopt(&self, incoming: Vec<UserAccount>) -> Result<(), InfraError> {
        let mut directory = self.lock_directory()?;
        for account in incoming {
            let winner = match directory.get(&account.username) {
                Some(current) => {
                    merge_last_write(current, current.last_sync, &account, account.last_sync, false).value
                }
                None => account,
            };
            directory.upsert(winner);
        }
        self.store.save(&directory)?;
        Ok(())
    }

    /// Clears dirty marks for accounts whose current local value is what the
    /// remote now holds. Anything edited while the pass was remote stays dirty.
    fn settle_dirty(&self, settled: &BTreeMap<String, UserAccount>) -> Result<(), InfraError> {
        let directory = self.lock_directory()?;
        let mut dirty = self.lock_dirty()?;
        dirty.retain(|username| settled.get(username) != directory.get(username));
        Ok(())
    }

    fn take_dirty(&self) -> Result<BTreeSet<String>, InfraError> {
        Ok(std::mem::take(&mut *self.lock_dirty()?))
    }

    fn restore_dirty(&self, usernames: impl IntoIterator<Item = String>) {
        if let Ok(mut dirty) = self.dirty.lock() {
            dirty.extend(usernames);
        }
    }

    fn lock_directory(&self) -> Result<MutexGuard<'_, AccountDirectory>, InfraError> {
        self.directory
            .lock()
            .map_err(|error| InfraError::InvalidState(format!("account directory lock poisoned: {error}")))
    }

    fn lock_dirty(&self) -> Result<MutexGuard<'_, BTreeSet<String>>, InfraError> {
        self.dirty
            .lock()
            .map_err(|error| InfraError::InvalidState(format!("account dirty set lock poisoned: {error}")))
    }
}

pub fn accounts_path(data_dir: &Path) -> PathBuf {
    data_dir.join(ACCOUNTS_FILE)
}

/// The account directory as a sync target: one remote document per username.
#[derive(Clone)]
pub struct AccountSync {
    service: Arc<AccountService>,
}

impl AccountSync {
    pub fn new(service: Arc<AccountService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl SyncTarget for AccountSync {
    type Document = UserAccount;

    fn label(&self) -> &'static str {
        "accounts"
    }

    async fn reconcile(&self, remote: &dyn RemoteStore<UserAccount>, force: bool) -> Result<PassReport, InfraError> {
        let remote_directory: AccountDirectory = remote
            .list()
            .await?
            .into_iter()
            .filter(|account| !account.username.trim().is_empty())
            .collect();
        let local = self.service.directory()?;
        let result = reconcile_accounts(&local, &remote_directory, force);

        if !result.pulled.is_empty() {
            let incoming = result
                .pulled
                .iter()
                .filter_map(|username| result.merged.get(username).cloned())
                .collect();
            self.service.adopt(incoming)?;
        }
        for username in &result.pushed {
            if let Some(account) = result.merged.get(username) {
                remote.put(username, account).await?;
            }
        }
        self.service.settle_dirty(&result.merged)?;

        Ok(PassReport {
            pulled: result.pulled.len(),
            pushed: result.pushed.len(),
            conflicts: result.conflicts,
        })
    }

    async fn push_local(&self, remote: &dyn RemoteStore<UserAccount>) -> Result<(), InfraError> {
        let dirty: Vec<String> = self.service.take_dirty()?.into_iter().collect();
        for (index, username) in dirty.iter().enumerate() {
            let Some(account) = self.service.account(username)? else {
                continue;
            };
            if let Err(error) = remote.put(username, &account).await {
                self.service.restore_dirty(dirty[index..].iter().cloned());
                return Err(error.into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::clock::testing::ManualClock;
    use crate::infrastructure::error::RemoteError;
    use crate::infrastructure::remote_store::InMemoryRemoteStore;
    use crate::test_support::TempWorkspace;
    use chrono::{DateTime, Utc};

    fn fixed(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value)
            .expect("valid datetime")
            .with_timezone(&Utc)
    }

    fn service(
        workspace: &TempWorkspace,
        clock: &ManualClock,
        remote: Option<&Arc<InMemoryRemoteStore<UserAccount>>>,
    ) -> AccountService {
        let remote = match remote {
            Some(store) => RemoteTarget::configured(store.clone()),
            None => RemoteTarget::Unconfigured,
        };
        AccountService::open(workspace.path(), remote, clock.clock())
    }

    #[test]
    fn password_hash_is_sha256_hex() {
        assert_eq!(
            hash_password("secret"),
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }

    #[test]
    fn usernames_must_be_path_safe() {
        assert_eq!(validate_username("  alice ").expect("valid"), "alice");
        for bad in ["", "../etc", "a/b", "a\\b", ".hidden"] {
            assert!(validate_username(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn register_then_login_and_remember() {
        let workspace = TempWorkspace::new("accounts");
        let clock = ManualClock::starting_at("2024-05-01T09:00:00Z");
        let accounts = service(&workspace, &clock, None);

        let created = accounts.register("alice", "secret").await.expect("register");
        assert_eq!(created.created_at, Some(fixed("2024-05-01T09:00:00Z")));
        assert!(matches!(
            accounts.register("alice", "other").await,
            Err(InfraError::AccountExists(_))
        ));
        assert!(matches!(accounts.current_user(), Err(InfraError::NotLoggedIn)));

        clock.advance(60);
        assert!(matches!(
            accounts.login("alice", "wrong").await,
            Err(InfraError::InvalidCredentials)
        ));
        assert!(matches!(
            accounts.login("bob", "secret").await,
            Err(InfraError::UnknownAccount(_))
        ));
        let logged_in = accounts.login("alice", "secret").await.expect("login");
        assert_eq!(logged_in.last_login, Some(fixed("2024-05-01T09:01:00Z")));
        assert_eq!(logged_in.last_sync, logged_in.last_login);

        let reopened = service(&workspace, &clock, None);
        assert_eq!(reopened.current_user().expect("remembered"), "alice");
        reopened.logout().expect("logout");
        reopened.logout().expect("logout twice");
        assert_eq!(reopened.auto_login().expect("auto login"), None);
    }

    #[tokio::test]
    async fn legacy_account_adopts_supplied_password() {
        let workspace = TempWorkspace::new("accounts");
        fs::write(
            accounts_path(workspace.path()),
            r#"{"carol": {"username": "carol", "created_at": "2023-01-01T00:00:00"}}"#,
        )
        .expect("seed");
        let clock = ManualClock::starting_at("2024-05-01T09:00:00Z");
        let accounts = service(&workspace, &clock, None);

        accounts.login("carol", "first").await.expect("adopt");
        assert!(matches!(
            accounts.login("carol", "second").await,
            Err(InfraError::InvalidCredentials)
        ));
        assert_eq!(
            accounts.account("carol").expect("lookup").expect("carol").password_hash,
            hash_password("first")
        );
    }

    #[tokio::test]
    async fn remote_accounts_block_registration_and_allow_login() {
        let workspace = TempWorkspace::new("accounts");
        let clock = ManualClock::starting_at("2024-05-01T09:00:00Z");
        let remote = Arc::new(InMemoryRemoteStore::default());
        remote.insert(
            "dave",
            UserAccount::new("dave", hash_password("pw"), fixed("2024-01-01T00:00:00Z")),
        );
        let accounts = service(&workspace, &clock, Some(&remote));

        assert!(matches!(
            accounts.register("dave", "pw").await,
            Err(InfraError::AccountExists(_))
        ));
        accounts.login("dave", "pw").await.expect("remote login");
        assert!(accounts.account("dave").expect("lookup").is_some());

        remote.set_offline(true);
        accounts.register("erin", "pw").await.expect("offline registration");
    }

    #[tokio::test]
    async fn one_time_code_logs_in_bound_identity_once() {
        let workspace = TempWorkspace::new("accounts");
        let clock = ManualClock::starting_at("2024-05-01T09:00:00Z");
        let accounts = service(&workspace, &clock, None);
        accounts.register("alice", "secret").await.expect("register");

        let mut code = OneTimeCode {
            code: "482913".to_string(),
            identity: "alice".to_string(),
            expires_at: fixed("2024-05-01T09:05:00Z"),
            used: false,
        };
        assert!(accounts.login_with_code(&mut code, "000000").await.is_err());
        let account = accounts.login_with_code(&mut code, "482913").await.expect("login");
        assert_eq!(account.username, "alice");
        assert!(code.used);
        assert!(accounts.login_with_code(&mut code, "482913").await.is_err());
    }

    #[tokio::test]
    async fn account_sync_unions_directories() {
        let workspace = TempWorkspace::new("accounts");
        let clock = ManualClock::starting_at("2024-05-01T09:00:00Z");
        let remote = Arc::new(InMemoryRemoteStore::default());
        remote.insert(
            "bob",
            UserAccount::new("bob", hash_password("b"), fixed("2024-01-01T00:00:00Z")),
        );
        let accounts = Arc::new(service(&workspace, &clock, None));
        accounts.register("alice", "a").await.expect("register");

        let target = AccountSync::new(Arc::clone(&accounts));
        let report = target.reconcile(remote.as_ref(), false).await.expect("reconcile");

        assert_eq!(report, PassReport { pulled: 1, pushed: 1, conflicts: 0 });
        assert!(accounts.account("bob").expect("lookup").is_some());
        assert!(remote.document("alice").is_some());

        let again = target.reconcile(remote.as_ref(), false).await.expect("second pass");
        assert_eq!(again, PassReport::default());
    }

    #[tokio::test]
    async fn push_local_uploads_dirty_accounts_and_retries_on_failure() {
        let workspace = TempWorkspace::new("accounts");
        let clock = ManualClock::starting_at("2024-05-01T09:00:00Z");
        let remote = Arc::new(InMemoryRemoteStore::default());
        let accounts = Arc::new(service(&workspace, &clock, None));
        accounts.register("alice", "a").await.expect("register");
        let target = AccountSync::new(Arc::clone(&accounts));

        remote.fail_next(RemoteError::Unreachable("offline".to_string()));
        assert!(target.push_local(remote.as_ref()).await.is_err());
        assert!(remote.document("alice").is_none());

        target.push_local(remote.as_ref()).await.expect("retry");
        assert!(remote.document("alice").is_some());
        assert_eq!(remote.put_calls(), 2);

        target.push_local(remote.as_ref()).await.expect("nothing dirty");
        assert_eq!(remote.put_calls(), 2);
    }

    /// Lets one local edit land while the first upload is in flight.
    struct EditDuringUpload {
        inner: Arc<InMemoryRemoteStore<UserAccount>>,
        accounts: Arc<AccountService>,
        edit: Mutex<Option<UserAccount>>,
    }

    #[async_trait]
    impl RemoteStore<UserAccount> for EditDuringUpload {
        async fn get(&self, key: &str) -> Result<Option<UserAccount>, RemoteError> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, document: &UserAccount) -> Result<(), RemoteError> {
            self.inner.put(key, document).await?;
            let edit = self.edit.lock().ok().and_then(|mut edit| edit.take());
            if let Some(edit) = edit {
                self.accounts
                    .store_account(edit)
                    .map_err(|error| RemoteError::Unreachable(error.to_string()))?;
            }
            Ok(())
        }

        async fn list(&self) -> Result<Vec<UserAccount>, RemoteError> {
            self.inner.list().await
        }

        async fn health(&self) -> Result<(), RemoteError> {
            self.inner.health().await
        }
    }

    #[tokio::test]
    async fn edits_made_during_a_pass_stay_queued_for_upload() {
        let workspace = TempWorkspace::new("accounts");
        let clock = ManualClock::starting_at("2024-05-01T09:00:00Z");
        let remote = Arc::new(InMemoryRemoteStore::default());
        let accounts = Arc::new(service(&workspace, &clock, None));
        accounts.register("alice", "a").await.expect("register");
        accounts.register("bob", "b").await.expect("register");

        let mut edited = accounts.account("alice").expect("lookup").expect("alice");
        edited.password_hash = hash_password("changed");
        let racing = EditDuringUpload {
            inner: Arc::clone(&remote),
            accounts: Arc::clone(&accounts),
            edit: Mutex::new(Some(edited)),
        };
        let target = AccountSync::new(Arc::clone(&accounts));
        let report = target.reconcile(&racing, false).await.expect("reconcile");
        assert_eq!(report.pushed, 2);
        assert_eq!(
            remote.document("alice").expect("alice").password_hash,
            hash_password("a")
        );

        target.push_local(remote.as_ref()).await.expect("push");
        assert_eq!(
            remote.document("alice").expect("alice").password_hash,
            hash_password("changed")
        );
        // bob was settled by the pass and is not uploaded again.
        assert_eq!(remote.put_calls(), 3);
    }
}
