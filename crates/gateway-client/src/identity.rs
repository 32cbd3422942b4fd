//! Session credential and profile persistence.
//!
//! A session lives in exactly one of two storage scopes: durable ("remember
//! me") or ephemeral (this process only). Writing a session to one scope
//! clears the other, so the token and profile always travel together.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

use crate::storage::{KeyValueStorage, MemoryStorage, StorageError};
use crate::types::UserProfile;

pub const TOKEN_KEY: &str = "token";
pub const PROFILE_KEY: &str = "user";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageScope {
    Durable,
    Ephemeral,
}

impl StorageScope {
    pub fn from_remember(remember: bool) -> Self {
        if remember { Self::Durable } else { Self::Ephemeral }
    }

    fn other(self) -> Self {
        match self {
            Self::Durable => Self::Ephemeral,
            Self::Ephemeral => Self::Durable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub profile: Option<UserProfile>,
    pub scope: StorageScope,
}

pub struct IdentityStore {
    durable: Arc<dyn KeyValueStorage>,
    ephemeral: Arc<dyn KeyValueStorage>,
    cached_profile: RwLock<Option<UserProfile>>,
    /// Advanced whenever a session starts or ends. Profile fetches started
    /// under an older epoch are not allowed to write back.
    epoch: AtomicU64,
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore")
            .field("scope", &self.current_scope())
            .finish_non_exhaustive()
    }
}

impl IdentityStore {
    pub fn new(durable: Arc<dyn KeyValueStorage>, ephemeral: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            durable,
            ephemeral,
            cached_profile: RwLock::new(None),
            epoch: AtomicU64::new(0),
        }
    }

    /// Both scopes held in memory.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStorage::new()), Arc::new(MemoryStorage::new()))
    }

    /// The process-scoped storage, also used by revalidating caches.
    pub fn ephemeral_storage(&self) -> Arc<dyn KeyValueStorage> {
        Arc::clone(&self.ephemeral)
    }

    fn storage(&self, scope: StorageScope) -> &dyn KeyValueStorage {
        match scope {
            StorageScope::Durable => self.durable.as_ref(),
            StorageScope::Ephemeral => self.ephemeral.as_ref(),
        }
    }

    /// Scope currently holding a token, durable first.
    pub fn current_scope(&self) -> Option<StorageScope> {
        [StorageScope::Durable, StorageScope::Ephemeral]
            .into_iter()
            .find(|scope| read_token(self.storage(*scope)).is_some())
    }

    pub fn get_token(&self) -> Option<String> {
        read_token(self.durable.as_ref()).or_else(|| read_token(self.ephemeral.as_ref()))
    }

    /// Persisted profile, durable first. An unreadable record counts as absent.
    pub fn get_stored_profile(&self) -> Option<UserProfile> {
        read_profile(self.durable.as_ref()).or_else(|| read_profile(self.ephemeral.as_ref()))
    }

    pub fn session(&self) -> Option<Session> {
        let scope = self.current_scope()?;
        let storage = self.storage(scope);
        Some(Session {
            token: read_token(storage)?,
            profile: read_profile(storage),
            scope,
        })
    }

    /// Stores a fresh session in the scope chosen by `remember`, removing any
    /// session held by the other scope first.
    pub fn set_session(
        &self,
        token: &str,
        profile: &UserProfile,
        remember: bool,
    ) -> Result<(), StorageError> {
        let scope = StorageScope::from_remember(remember);
        clear_scope(self.storage(scope.other()), scope.other());

        let encoded = encode_profile(profile)?;
        let target = self.storage(scope);
        let written = target
            .set_item(TOKEN_KEY, token)
            .and_then(|()| target.set_item(PROFILE_KEY, &encoded));
        if let Err(error) = written {
            tracing::warn!(error = %error, scope = ?scope, "failed to persist session");
            clear_scope(target, scope);
            return Err(error);
        }

        let mut cached = self.write_cache();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        *cached = Some(profile.clone());
        drop(cached);
        tracing::debug!(scope = ?scope, "session stored");
        Ok(())
    }

    /// Rewrites the profile next to the current token. Without a token there
    /// is no session to attach it to and nothing is written.
    pub fn store_profile(&self, profile: &UserProfile) -> Result<(), StorageError> {
        let Some(scope) = self.current_scope() else {
            tracing::debug!("no active session, profile not stored");
            return Ok(());
        };
        let encoded = encode_profile(profile)?;
        self.storage(scope)
            .set_item(PROFILE_KEY, &encoded)
            .inspect_err(|error| {
                tracing::warn!(error = %error, scope = ?scope, "failed to persist profile");
            })
    }

    /// Drops stored profile copies but keeps the credential.
    pub fn clear_stored_profile(&self) {
        for scope in [StorageScope::Durable, StorageScope::Ephemeral] {
            if let Err(error) = self.storage(scope).remove_item(PROFILE_KEY) {
                tracing::warn!(error = %error, scope = ?scope, "failed to remove profile");
            }
        }
    }

    /// Removes token and profile from both scopes and forgets the cached
    /// profile. Profile fetches still in flight can no longer write back.
    pub fn clear_session(&self) {
        let mut cached = self.write_cache();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        clear_scope(self.durable.as_ref(), StorageScope::Durable);
        clear_scope(self.ephemeral.as_ref(), StorageScope::Ephemeral);
        cached.take();
    }

    pub fn session_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Detaches fetches started before this call without touching storage.
    pub fn advance_epoch(&self) {
        let mut cached = self.write_cache();
        self.epoch.fetch_add(1, Ordering::AcqRel);
        cached.take();
    }

    /// Caches and stores a fetched profile if the session has not changed
    /// since `epoch`. Returns whether the profile was accepted.
    pub fn commit_profile(&self, epoch: u64, profile: &UserProfile) -> bool {
        let mut cached = self.write_cache();
        if self.session_epoch() != epoch {
            tracing::debug!(epoch, "discarding profile fetched for an ended session");
            return false;
        }
        *cached = Some(profile.clone());
        // Storage failure still leaves the memory copy usable.
        let _ = self.store_profile(profile);
        true
    }

    pub fn cached_profile(&self) -> Option<UserProfile> {
        self.cached_profile
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn cache_profile(&self, profile: UserProfile) {
        *self.write_cache() = Some(profile);
    }

    pub fn forget_cached_profile(&self) {
        self.write_cache().take();
    }

    fn write_cache(&self) -> RwLockWriteGuard<'_, Option<UserProfile>> {
        self.cached_profile
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn read_token(storage: &dyn KeyValueStorage) -> Option<String> {
    storage
        .get_item(TOKEN_KEY)
        .filter(|token| !token.trim().is_empty())
}

fn read_profile(storage: &dyn KeyValueStorage) -> Option<UserProfile> {
    let raw = storage.get_item(PROFILE_KEY)?;
    match serde_json::from_str::<UserProfile>(&raw) {
        Ok(profile) => Some(profile),
        Err(error) => {
            tracing::warn!(error = %error, "ignoring unreadable stored profile");
            None
        }
    }
}

fn encode_profile(profile: &UserProfile) -> Result<String, StorageError> {
    serde_json::to_string(profile).map_err(|error| StorageError::Encode(error.to_string()))
}

fn clear_scope(storage: &dyn KeyValueStorage, scope: StorageScope) {
    for key in [TOKEN_KEY, PROFILE_KEY] {
        if let Err(error) = storage.remove_item(key) {
            tracing::warn!(error = %error, scope = ?scope, key, "failed to clear session entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(id: &str) -> UserProfile {
        UserProfile {
            id: id.to_string(),
            email: format!("{id}@example.com"),
            ..UserProfile::default()
        }
    }

    fn store() -> (IdentityStore, Arc<MemoryStorage>, Arc<MemoryStorage>) {
        let durable = Arc::new(MemoryStorage::new());
        let ephemeral = Arc::new(MemoryStorage::new());
        let store = IdentityStore::new(durable.clone(), ephemeral.clone());
        (store, durable, ephemeral)
    }

    #[test]
    fn remembered_session_is_durable() {
        let (store, durable, ephemeral) = store();
        store.set_session("tok", &profile("u1"), true).expect("store session");

        assert_eq!(store.get_token().as_deref(), Some("tok"));
        assert_eq!(store.current_scope(), Some(StorageScope::Durable));
        assert!(durable.get_item(PROFILE_KEY).is_some());
        assert!(ephemeral.is_empty());
        assert_eq!(store.cached_profile(), Some(profile("u1")));
    }

    #[test]
    fn switching_scope_clears_the_other_scope() {
        let (store, durable, ephemeral) = store();
        store.set_session("durable", &profile("u1"), true).expect("durable session");
        store.set_session("ephemeral", &profile("u2"), false).expect("ephemeral session");

        assert!(durable.is_empty());
        assert_eq!(ephemeral.get_item(TOKEN_KEY).as_deref(), Some("ephemeral"));
        let session = store.session().expect("active session");
        assert_eq!(session.scope, StorageScope::Ephemeral);
        assert_eq!(session.profile, Some(profile("u2")));
    }

    #[test]
    fn reads_prefer_durable_scope() {
        let (store, durable, ephemeral) = store();
        durable.set_item(TOKEN_KEY, "durable").expect("seed durable");
        ephemeral.set_item(TOKEN_KEY, "ephemeral").expect("seed ephemeral");
        assert_eq!(store.get_token().as_deref(), Some("durable"));
    }

    #[test]
    fn clear_session_removes_everything() {
        let (store, durable, ephemeral) = store();
        store.set_session("tok", &profile("u1"), false).expect("store session");
        durable.set_item(PROFILE_KEY, "{}").expect("seed stray profile");

        store.clear_session();

        assert!(durable.is_empty());
        assert!(ephemeral.is_empty());
        assert_eq!(store.get_token(), None);
        assert_eq!(store.cached_profile(), None);
    }

    #[test]
    fn corrupt_profile_reads_as_absent() {
        let (store, durable, _) = store();
        durable.set_item(PROFILE_KEY, "{broken").expect("seed corrupt");
        assert_eq!(store.get_stored_profile(), None);
    }

    #[test]
    fn store_profile_follows_token_scope() {
        let (store, durable, ephemeral) = store();
        store.set_session("tok", &profile("u1"), false).expect("store session");
        store.store_profile(&profile("u9")).expect("refresh profile");

        assert!(durable.is_empty());
        assert_eq!(store.get_stored_profile(), Some(profile("u9")));

        store.clear_stored_profile();
        assert_eq!(store.get_stored_profile(), None);
        assert_eq!(ephemeral.get_item(TOKEN_KEY).as_deref(), Some("tok"));
    }

    #[test]
    fn store_profile_without_session_writes_nothing() {
        let (store, durable, ephemeral) = store();
        store.store_profile(&profile("u1")).expect("no-op");

        assert!(durable.is_empty());
        assert!(ephemeral.is_empty());
    }

    #[test]
    fn profile_fetched_before_clear_session_is_rejected() {
        let (store, durable, _) = store();
        store.set_session("tok", &profile("u1"), true).expect("store session");
        let epoch = store.session_epoch();

        store.clear_session();

        assert!(!store.commit_profile(epoch, &profile("u2")));
        assert_eq!(store.cached_profile(), None);
        assert!(durable.is_empty());
    }

    #[test]
    fn profile_fetched_in_current_session_is_kept() {
        let (store, durable, _) = store();
        store.set_session("tok", &profile("u1"), true).expect("store session");
        let epoch = store.session_epoch();

        assert!(store.commit_profile(epoch, &profile("u2")));
        assert_eq!(store.cached_profile(), Some(profile("u2")));
        assert!(durable.get_item(PROFILE_KEY).is_some());
        assert_eq!(store.get_stored_profile(), Some(profile("u2")));
    }

    #[test]
    fn failed_session_write_leaves_no_partial_session() {
        let durable = Arc::new(MemoryStorage::with_quota(12));
        let store = IdentityStore::new(durable.clone(), Arc::new(MemoryStorage::new()));

        let error = store
            .set_session("tok", &profile("u1"), true)
            .expect_err("profile exceeds quota");
        assert!(matches!(error, StorageError::QuotaExceeded { .. }));
        assert!(durable.is_empty());
        assert_eq!(store.get_token(), None);
    }
}
