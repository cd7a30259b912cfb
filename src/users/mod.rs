//! User profiles and the session index
//!
//! Layout in the users namespace:
//! - `user:{id}`: hash profile (`name`, `email`, JSON `preferences`,
//!   `created_at`, `last_active`)
//! - `user_sessions:{id}`: hash of session key -> attach time
//! - `session_owner:{session}`: back-reference to the owning user id
//! - `deleted_user:{id}`: deletion time of a removed profile
//!
//! Deleting a profile leaves the session index in place and records a
//! tombstone, so a removed user is still known to have existed.
//!
//! Moving a session between users is two separate writes (remove from the old
//! owner, add to the new one); the backend offers no multi-key transaction, so
//! a failure in between can leave the session briefly unindexed.

use crate::backend::{KvBackend, Namespace, RetryPolicy, RetryingBackend};
use crate::error::MemoryError;
use crate::models::{merge_preferences, NewUser, Preferences, UserContext, UserProfile, UserUpdate};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

const USER_PREFIX: &str = "user:";
const SESSIONS_PREFIX: &str = "user_sessions:";
const OWNER_PREFIX: &str = "session_owner:";
const TOMBSTONE_PREFIX: &str = "deleted_user:";

const FIELD_USER_ID: &str = "user_id";
const FIELD_NAME: &str = "name";
const FIELD_EMAIL: &str = "email";
const FIELD_PREFERENCES: &str = "preferences";
const FIELD_CREATED_AT: &str = "created_at";
const FIELD_LAST_ACTIVE: &str = "last_active";

fn user_key(user_id: &str) -> String {
    format!("{}{}", USER_PREFIX, user_id)
}

fn sessions_key(user_id: &str) -> String {
    format!("{}{}", SESSIONS_PREFIX, user_id)
}

fn owner_key(session_key: &str) -> String {
    format!("{}{}", OWNER_PREFIX, session_key)
}

fn tombstone_key(user_id: &str) -> String {
    format!("{}{}", TOMBSTONE_PREFIX, user_id)
}

fn require_non_empty(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MemoryError::InvalidInput(format!("{} must not be empty", what)));
    }
    Ok(())
}

fn field_str(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<String> {
    fields
        .get(name)
        .and_then(|raw| String::from_utf8(raw.clone()).ok())
}

fn field_time(fields: &HashMap<String, Vec<u8>>, name: &str) -> Option<DateTime<Utc>> {
    field_str(fields, name)
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn decode_profile(user_id: &str, fields: &HashMap<String, Vec<u8>>) -> Result<UserProfile> {
    let created_at = field_time(fields, FIELD_CREATED_AT).ok_or_else(|| {
        MemoryError::InvalidInput(format!("stored profile for '{}' has no created_at", user_id))
    })?;
    let preferences: Preferences = match fields.get(FIELD_PREFERENCES) {
        Some(raw) => serde_json::from_slice(raw)?,
        None => Preferences::new(),
    };

    Ok(UserProfile {
        user_id: field_str(fields, FIELD_USER_ID).unwrap_or_else(|| user_id.to_string()),
        name: field_str(fields, FIELD_NAME),
        email: field_str(fields, FIELD_EMAIL),
        preferences,
        created_at,
        last_active: field_time(fields, FIELD_LAST_ACTIVE).unwrap_or(created_at),
    })
}

/// Profile and session-index store
#[derive(Clone)]
pub struct UserStore {
    backend: Arc<dyn KvBackend>,
}

impl UserStore {
    /// Wraps `backend` in the given retry policy.
    pub fn new(backend: Arc<dyn KvBackend>, retry: RetryPolicy) -> Self {
        Self {
            backend: Arc::new(RetryingBackend::new(backend, retry)),
        }
    }

    async fn profile_fields(&self, user_id: &str) -> Result<HashMap<String, Vec<u8>>> {
        self.backend
            .hash_get_all(Namespace::Users, &user_key(user_id))
            .await
    }

    async fn set_field(&self, user_id: &str, field: &str, value: &[u8]) -> Result<()> {
        self.backend
            .hash_set(Namespace::Users, &user_key(user_id), field, value)
            .await
    }

    /// Register a new user.
    pub async fn create_user(&self, new_user: NewUser) -> Result<UserProfile> {
        require_non_empty(&new_user.user_id, "user_id")?;
        let user_id = new_user.user_id;

        if !self.profile_fields(&user_id).await?.is_empty() {
            return Err(MemoryError::AlreadyExists(format!(
                "user '{}' is already registered",
                user_id
            )));
        }

        let now = Utc::now();
        let profile = UserProfile {
            user_id: user_id.clone(),
            name: new_user.name,
            email: new_user.email,
            preferences: new_user.preferences.unwrap_or_default(),
            created_at: now,
            last_active: now,
        };

        // created_at goes first: a profile without it is treated as corrupt.
        let stamp = now.to_rfc3339();
        self.set_field(&user_id, FIELD_CREATED_AT, stamp.as_bytes()).await?;
        self.set_field(&user_id, FIELD_LAST_ACTIVE, stamp.as_bytes()).await?;
        self.set_field(&user_id, FIELD_USER_ID, user_id.as_bytes()).await?;
        if let Some(name) = &profile.name {
            self.set_field(&user_id, FIELD_NAME, name.as_bytes()).await?;
        }
        if let Some(email) = &profile.email {
            self.set_field(&user_id, FIELD_EMAIL, email.as_bytes()).await?;
        }
        let prefs = serde_json::to_vec(&profile.preferences)?;
        self.set_field(&user_id, FIELD_PREFERENCES, &prefs).await?;
        self.backend
            .delete(Namespace::Users, &tombstone_key(&user_id))
            .await?;

        info!(user_id = %user_id, "User created");
        Ok(profile)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<UserProfile> {
        let fields = self.profile_fields(user_id).await?;
        if fields.is_empty() {
            return Err(MemoryError::NotFound(format!("user '{}'", user_id)));
        }
        decode_profile(user_id, &fields)
    }

    /// Merge the present fields of `update` into the stored profile.
    ///
    /// Preferences merge key by key (nested maps recursively); the read and
    /// the write are separate calls, so concurrent updates to one user can
    /// lose a preference key.
    pub async fn update_user(&self, user_id: &str, update: UserUpdate) -> Result<UserProfile> {
        let mut profile = self.get_user(user_id).await?;

        if let Some(name) = update.name {
            self.set_field(user_id, FIELD_NAME, name.as_bytes()).await?;
            profile.name = Some(name);
        }
        if let Some(email) = update.email {
            self.set_field(user_id, FIELD_EMAIL, email.as_bytes()).await?;
            profile.email = Some(email);
        }
        if let Some(preferences) = update.preferences {
            merge_preferences(&mut profile.preferences, preferences);
            let encoded = serde_json::to_vec(&profile.preferences)?;
            self.set_field(user_id, FIELD_PREFERENCES, &encoded).await?;
        }

        profile.last_active = Utc::now();
        self.set_field(
            user_id,
            FIELD_LAST_ACTIVE,
            profile.last_active.to_rfc3339().as_bytes(),
        )
        .await?;

        debug!(user_id, "User updated");
        Ok(profile)
    }

    /// Remove the profile. The session index is kept for history and a
    /// tombstone marks the user as deleted.
    pub async fn delete_user(&self, user_id: &str) -> Result<()> {
        if self.profile_fields(user_id).await?.is_empty() {
            debug!(user_id, "Delete of absent user");
            return Ok(());
        }

        self.backend
            .set(
                Namespace::Users,
                &tombstone_key(user_id),
                Utc::now().to_rfc3339().as_bytes(),
                None,
            )
            .await?;
        self.backend
            .delete(Namespace::Users, &user_key(user_id))
            .await?;
        info!(user_id, "User deleted");
        Ok(())
    }

    async fn was_deleted(&self, user_id: &str) -> Result<bool> {
        Ok(self
            .backend
            .get(Namespace::Users, &tombstone_key(user_id))
            .await?
            .is_some())
    }

    /// Index `session_key` under `user_id`, taking it away from any previous
    /// owner first.
    pub async fn attach_session(&self, user_id: &str, session_key: &str) -> Result<()> {
        require_non_empty(session_key, "session key")?;
        if self.profile_fields(user_id).await?.is_empty() {
            return Err(MemoryError::NotFound(format!("user '{}'", user_id)));
        }

        let owner_key = owner_key(session_key);
        let previous = self
            .backend
            .get(Namespace::Users, &owner_key)
            .await?
            .and_then(|raw| String::from_utf8(raw).ok());

        if let Some(previous) = previous.as_deref().filter(|p| *p != user_id) {
            self.backend
                .hash_delete(Namespace::Users, &sessions_key(previous), session_key)
                .await?;
            info!(session_key, from = previous, to = user_id, "Session reassigned");
        }

        let now = Utc::now().to_rfc3339();
        self.backend
            .hash_set(
                Namespace::Users,
                &sessions_key(user_id),
                session_key,
                now.as_bytes(),
            )
            .await?;
        self.backend
            .set(Namespace::Users, &owner_key, user_id.as_bytes(), None)
            .await?;
        self.set_field(user_id, FIELD_LAST_ACTIVE, now.as_bytes()).await?;

        debug!(user_id, session_key, "Session attached");
        Ok(())
    }

    /// Sessions indexed under the user; empty for unknown users.
    pub async fn get_user_sessions(&self, user_id: &str) -> Result<BTreeSet<String>> {
        let index = self
            .backend
            .hash_get_all(Namespace::Users, &sessions_key(user_id))
            .await?;
        Ok(index.into_keys().collect())
    }

    /// Current owner of a session, if any.
    pub async fn session_owner(&self, session_key: &str) -> Result<Option<String>> {
        Ok(self
            .backend
            .get(Namespace::Users, &owner_key(session_key))
            .await?
            .and_then(|raw| String::from_utf8(raw).ok()))
    }

    /// Profile facts plus session count, for prompt assembly.
    ///
    /// A deleted user still has a context (`registered: false`); only a user
    /// with no profile, no tombstone and no indexed sessions is `NotFound`.
    pub async fn get_user_context(&self, user_id: &str) -> Result<UserContext> {
        let fields = self.profile_fields(user_id).await?;
        let sessions = self.get_user_sessions(user_id).await?;

        if fields.is_empty() {
            if sessions.is_empty() && !self.was_deleted(user_id).await? {
                return Err(MemoryError::NotFound(format!("user '{}'", user_id)));
            }
            return Ok(UserContext {
                user_id: user_id.to_string(),
                registered: false,
                name: None,
                email: None,
                preferences: Preferences::new(),
                session_count: sessions.len(),
                created_at: None,
                last_active: None,
            });
        }

        let profile = decode_profile(user_id, &fields)?;
        Ok(UserContext {
            user_id: profile.user_id,
            registered: true,
            name: profile.name,
            email: profile.email,
            preferences: profile.preferences,
            session_count: sessions.len(),
            created_at: Some(profile.created_at),
            last_active: Some(profile.last_active),
        })
    }

    /// Every stored profile, ordered by user id.
    pub async fn list_users(&self) -> Result<Vec<UserProfile>> {
        let keys = self.backend.scan_prefix(Namespace::Users, USER_PREFIX).await?;
        let mut users = Vec::with_capacity(keys.len());

        for key in keys {
            let Some(user_id) = key.strip_prefix(USER_PREFIX) else {
                continue;
            };
            let fields = self.profile_fields(user_id).await?;
            if fields.is_empty() {
                continue; // expired or deleted since the scan
            }
            match decode_profile(user_id, &fields) {
                Ok(profile) => users.push(profile),
                Err(e) => warn!(user_id, error = %e, "Skipping unreadable profile"),
            }
        }

        Ok(users)
    }

    /// Check the users namespace is reachable.
    pub async fn ping(&self) -> Result<()> {
        self.backend.ping(Namespace::Users).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::retry::tests::FlakyBackend;
    use crate::backend::InMemoryBackend;
    use crate::error::ErrorKind;
    use crate::models::PreferenceValue;
    use tokio_test::{assert_err, assert_ok};

    fn store() -> UserStore {
        UserStore::new(Arc::new(InMemoryBackend::new()), RetryPolicy::default())
    }

    fn new_user(id: &str) -> NewUser {
        NewUser {
            user_id: id.to_string(),
            name: Some(format!("User {}", id)),
            email: Some(format!("{}@example.com", id)),
            preferences: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_user() {
        let users = store();
        let created = users.create_user(new_user("u1")).await.unwrap();
        assert!(created.preferences.is_empty());

        let fetched = users.get_user("u1").await.unwrap();
        assert_eq!(fetched.name.as_deref(), Some("User u1"));
        assert_eq!(fetched.email.as_deref(), Some("u1@example.com"));
        assert_eq!(fetched.created_at, created.created_at);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicates_and_empty_ids() {
        let users = store();
        users.create_user(new_user("u1")).await.unwrap();

        let dup = assert_err!(users.create_user(new_user("u1")).await);
        assert_eq!(dup.kind(), ErrorKind::AlreadyExists);

        let empty = assert_err!(users.create_user(new_user("  ")).await);
        assert_eq!(empty.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn test_get_missing_user_is_not_found() {
        let err = store().get_user("ghost").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_update_merges_preferences() {
        let users = store();
        let mut prefs = Preferences::new();
        prefs.insert("language".into(), "es".into());
        prefs.insert("topics_interest".into(), "astronomy".into());
        users
            .create_user(NewUser {
                preferences: Some(prefs),
                ..new_user("u1")
            })
            .await
            .unwrap();

        let mut change = Preferences::new();
        change.insert("language".into(), "en".into());
        let updated = users
            .update_user(
                "u1",
                UserUpdate {
                    preferences: Some(change),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name.as_deref(), Some("User u1"));
        let stored = users.get_user("u1").await.unwrap();
        assert_eq!(stored.preferences["language"], PreferenceValue::from("en"));
        assert_eq!(
            stored.preferences["topics_interest"],
            PreferenceValue::from("astronomy")
        );
        assert_eq!(stored, updated);
    }

    #[tokio::test]
    async fn test_update_only_touches_given_fields() {
        let users = store();
        users.create_user(new_user("u1")).await.unwrap();

        users
            .update_user(
                "u1",
                UserUpdate {
                    email: Some("new@example.com".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stored = users.get_user("u1").await.unwrap();
        assert_eq!(stored.email.as_deref(), Some("new@example.com"));
        assert_eq!(stored.name.as_deref(), Some("User u1"));
    }

    #[tokio::test]
    async fn test_update_missing_user_is_not_found() {
        let err = store()
            .update_user("ghost", UserUpdate::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent_and_keeps_index() {
        let users = store();
        users.create_user(new_user("u1")).await.unwrap();
        users.attach_session("u1", "s1").await.unwrap();

        users.delete_user("u1").await.unwrap();
        assert_ok!(users.delete_user("u1").await);

        assert_eq!(users.get_user("u1").await.unwrap_err().kind(), ErrorKind::NotFound);
        let sessions = users.get_user_sessions("u1").await.unwrap();
        assert!(sessions.contains("s1"));
    }

    #[tokio::test]
    async fn test_attach_requires_existing_user() {
        let err = store().attach_session("ghost", "s1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_reattaching_moves_session_between_users() {
        let users = store();
        users.create_user(new_user("a")).await.unwrap();
        users.create_user(new_user("b")).await.unwrap();

        users.attach_session("a", "s1").await.unwrap();
        users.attach_session("a", "s2").await.unwrap();
        users.attach_session("b", "s1").await.unwrap();

        let a_sessions = users.get_user_sessions("a").await.unwrap();
        let b_sessions = users.get_user_sessions("b").await.unwrap();
        assert!(!a_sessions.contains("s1"));
        assert!(a_sessions.contains("s2"));
        assert!(b_sessions.contains("s1"));
        assert_eq!(users.session_owner("s1").await.unwrap().as_deref(), Some("b"));

        // Attaching to the current owner again is a no-op for the index.
        users.attach_session("b", "s1").await.unwrap();
        assert_eq!(users.get_user_sessions("b").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sessions_of_unknown_user_are_empty() {
        assert!(store().get_user_sessions("ghost").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_user_context_shapes() {
        let users = store();
        users.create_user(new_user("u1")).await.unwrap();
        users.attach_session("u1", "s1").await.unwrap();
        users.attach_session("u1", "s2").await.unwrap();

        let ctx = users.get_user_context("u1").await.unwrap();
        assert!(ctx.registered);
        assert_eq!(ctx.session_count, 2);
        assert_eq!(ctx.name.as_deref(), Some("User u1"));

        users.delete_user("u1").await.unwrap();
        let ctx = users.get_user_context("u1").await.unwrap();
        assert!(!ctx.registered);
        assert_eq!(ctx.session_count, 2);
        assert_eq!(ctx.name, None);

        let err = users.get_user_context("never").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_deleted_user_without_sessions_keeps_context() {
        let users = store();
        users.create_user(new_user("u1")).await.unwrap();
        users.delete_user("u1").await.unwrap();

        let ctx = assert_ok!(users.get_user_context("u1").await);
        assert!(!ctx.registered);
        assert_eq!(ctx.session_count, 0);
        assert_eq!(ctx.email, None);

        // Deleting someone who never existed leaves no trace.
        users.delete_user("never").await.unwrap();
        let err = users.get_user_context("never").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_recreating_deleted_user_registers_again() {
        let users = store();
        users.create_user(new_user("u1")).await.unwrap();
        users.delete_user("u1").await.unwrap();
        users.create_user(new_user("u1")).await.unwrap();

        assert!(users.get_user_context("u1").await.unwrap().registered);
        users.delete_user("u1").await.unwrap();
        assert!(!users.get_user_context("u1").await.unwrap().registered);
    }

    #[tokio::test]
    async fn test_list_users_sorted() {
        let users = store();
        users.create_user(new_user("zoe")).await.unwrap();
        users.create_user(new_user("adam")).await.unwrap();
        users.attach_session("adam", "s1").await.unwrap();

        let ids: Vec<_> = users
            .list_users()
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.user_id)
            .collect();
        assert_eq!(ids, vec!["adam", "zoe"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_outage_is_backend_unavailable() {
        let flaky = Arc::new(FlakyBackend::new(0));
        let users = UserStore::new(flaky.clone(), RetryPolicy::default());
        users.create_user(new_user("u1")).await.unwrap();

        flaky.fail_next(50);
        let err = users.get_user("u1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendUnavailable);
    }
}
