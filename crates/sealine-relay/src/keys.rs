use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use sealine_db::Database;
use sealine_db::models::{IdentityOutcome, PreKeyRow};
use sealine_types::error::RelayError;
use sealine_types::events::PushEvent;
use sealine_types::models::{PreKey, PreKeyBundle};

use crate::router::DeliveryRouter;
use crate::sessions::SessionStore;

/// Identity keys and one-time prekeys per user. Hands out each prekey at
/// most once; exhaustion below the low-water mark nudges the owning client
/// to upload a fresh batch.
#[derive(Clone)]
pub struct KeyDirectory {
    db: Arc<Database>,
    sessions: SessionStore,
    router: DeliveryRouter,
    low_water: u32,
}

impl KeyDirectory {
    pub fn new(
        db: Arc<Database>,
        sessions: SessionStore,
        router: DeliveryRouter,
        low_water: u32,
    ) -> Self {
        Self {
            db,
            sessions,
            router,
            low_water,
        }
    }

    /// Install the immutable identity key for a user. Re-registering the
    /// same material is accepted silently; different material conflicts.
    pub async fn register_identity(
        &self,
        user_id: Uuid,
        identity_key: String,
        registration_id: u32,
    ) -> Result<(), RelayError> {
        let db = self.db.clone();
        let uid = user_id.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            db.register_identity(&uid, &identity_key, registration_id as i64)
        })
        .await
        .map_err(|e| RelayError::Internal(e.to_string()))?
        .map_err(|e| RelayError::StorageWrite(e.to_string()))?;

        match outcome {
            IdentityOutcome::Installed => {
                info!("Identity registered for {}", user_id);
                Ok(())
            }
            IdentityOutcome::Unchanged => Ok(()),
            IdentityOutcome::Conflict => Err(RelayError::IdentityConflict(user_id)),
        }
    }

    /// Append a batch of unconsumed prekeys. Any repeated key id — within
    /// the batch or against previously uploaded keys — rejects the whole
    /// batch; the client must resubmit with fresh ids. Returns the
    /// unconsumed count after the upload.
    pub async fn upload_prekeys(
        &self,
        user_id: Uuid,
        keys: Vec<PreKey>,
    ) -> Result<u32, RelayError> {
        let mut seen = HashSet::new();
        for key in &keys {
            if !seen.insert(key.key_id) {
                return Err(RelayError::DuplicateKeyId(key.key_id));
            }
        }

        let rows: Vec<PreKeyRow> = keys
            .into_iter()
            .map(|k| PreKeyRow {
                key_id: k.key_id as i64,
                public_key: k.public_key,
                signature: k.signature,
            })
            .collect();

        let db = self.db.clone();
        let uid = user_id.to_string();
        let dup = tokio::task::spawn_blocking(move || db.insert_prekeys(&uid, &rows))
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .map_err(|e| RelayError::StorageWrite(e.to_string()))?;

        if let Some(key_id) = dup {
            return Err(RelayError::DuplicateKeyId(key_id as u32));
        }

        let remaining = self.remaining(user_id).await?;
        debug!("{} now has {} unconsumed prekeys", user_id, remaining);
        Ok(remaining)
    }

    /// Return the identity key plus exactly one unconsumed prekey, lowest
    /// key id first, atomically marked consumed — concurrent fetches never
    /// receive the same key. A successful fetch (re-)establishes the
    /// caller's session toward the target; dropping below the low-water
    /// mark pushes a replenish request to the owner.
    pub async fn fetch_bundle(
        &self,
        caller_id: Uuid,
        target_id: Uuid,
    ) -> Result<PreKeyBundle, RelayError> {
        let db = self.db.clone();
        let uid = target_id.to_string();
        let user = tokio::task::spawn_blocking(move || db.get_user_by_id(&uid))
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .ok_or(RelayError::UnknownUser(target_id))?;

        let (identity_key, registration_id) = match (user.identity_key, user.registration_id) {
            (Some(ik), Some(rid)) => (ik, rid as u32),
            // Registered by phone but no identity uploaded yet: no session
            // can be bootstrapped against this user.
            _ => return Err(RelayError::UnknownUser(target_id)),
        };

        let db = self.db.clone();
        let uid = target_id.to_string();
        let claimed = tokio::task::spawn_blocking(move || db.claim_lowest_prekey(&uid))
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .map_err(|e| RelayError::StorageWrite(e.to_string()))?
            .ok_or(RelayError::KeyExhausted(target_id))?;

        self.sessions.establish(caller_id, target_id).await;

        let remaining = self.remaining(target_id).await?;
        if remaining < self.low_water {
            debug!(
                "{} below prekey low-water mark ({} < {})",
                target_id, remaining, self.low_water
            );
            self.router
                .send_event(target_id, PushEvent::ReplenishRequested { remaining })
                .await;
        }

        Ok(PreKeyBundle {
            user_id: target_id,
            identity_key,
            registration_id,
            prekey: PreKey {
                key_id: claimed.key_id as u32,
                public_key: claimed.public_key,
                signature: claimed.signature,
            },
        })
    }

    pub async fn remaining(&self, user_id: Uuid) -> Result<u32, RelayError> {
        let db = self.db.clone();
        let uid = user_id.to_string();
        let count = tokio::task::spawn_blocking(move || db.count_unconsumed_prekeys(&uid))
            .await
            .map_err(|e| RelayError::Internal(e.to_string()))?
            .map_err(|e| RelayError::Internal(e.to_string()))?;
        Ok(count as u32)
    }

    /// Replenishment nudge for a freshly connected client: `Some(count)` if
    /// its pool sits below the low-water mark.
    pub async fn replenish_hint(&self, user_id: Uuid) -> Result<Option<u32>, RelayError> {
        let remaining = self.remaining(user_id).await?;
        Ok((remaining < self.low_water).then_some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn prekey(key_id: u32) -> PreKey {
        PreKey {
            key_id,
            public_key: format!("pk-{}", key_id),
            signature: format!("sig-{}", key_id),
        }
    }

    async fn directory() -> (KeyDirectory, Uuid, Uuid) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let caller = Uuid::new_v4();
        let target = Uuid::new_v4();
        db.create_user_if_absent(&caller.to_string(), "+15550001")
            .unwrap();
        db.create_user_if_absent(&target.to_string(), "+15550002")
            .unwrap();
        let dir = KeyDirectory::new(
            db,
            SessionStore::new(),
            DeliveryRouter::new(Duration::from_secs(5)),
            3,
        );
        dir.register_identity(target, "ik-target".into(), 42)
            .await
            .unwrap();
        (dir, caller, target)
    }

    #[tokio::test]
    async fn fetch_consumes_lowest_key_first_and_exhausts() {
        let (dir, caller, target) = directory().await;
        dir.upload_prekeys(target, vec![prekey(7), prekey(3)])
            .await
            .unwrap();

        let first = dir.fetch_bundle(caller, target).await.unwrap();
        assert_eq!(first.prekey.key_id, 3);
        assert_eq!(first.identity_key, "ik-target");

        let second = dir.fetch_bundle(caller, target).await.unwrap();
        assert_eq!(second.prekey.key_id, 7);

        let err = dir.fetch_bundle(caller, target).await.unwrap_err();
        assert!(matches!(err, RelayError::KeyExhausted(_)));
    }

    #[tokio::test]
    async fn concurrent_fetches_never_share_a_key() {
        let (dir, caller, target) = directory().await;
        dir.upload_prekeys(target, vec![prekey(1)]).await.unwrap();

        let other_caller = Uuid::new_v4();
        let a = {
            let dir = dir.clone();
            tokio::spawn(async move { dir.fetch_bundle(caller, target).await })
        };
        let b = {
            let dir = dir.clone();
            tokio::spawn(async move { dir.fetch_bundle(other_caller, target).await })
        };

        let results = [a.await.unwrap(), b.await.unwrap()];
        let successes = results.iter().filter(|r| r.is_ok()).count();
        let exhausted = results
            .iter()
            .filter(|r| matches!(r, Err(RelayError::KeyExhausted(_))))
            .count();
        assert_eq!(successes, 1);
        assert_eq!(exhausted, 1);
    }

    #[tokio::test]
    async fn duplicate_key_id_rejects_batch() {
        let (dir, _caller, target) = directory().await;
        dir.upload_prekeys(target, vec![prekey(1)]).await.unwrap();

        let within = dir
            .upload_prekeys(target, vec![prekey(2), prekey(2)])
            .await
            .unwrap_err();
        assert!(matches!(within, RelayError::DuplicateKeyId(2)));

        let against_stored = dir
            .upload_prekeys(target, vec![prekey(3), prekey(1)])
            .await
            .unwrap_err();
        assert!(matches!(against_stored, RelayError::DuplicateKeyId(1)));

        assert_eq!(dir.remaining(target).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn low_water_emits_replenish_request() {
        let (dir, caller, target) = directory().await;
        dir.upload_prekeys(target, vec![prekey(1), prekey(2), prekey(3)])
            .await
            .unwrap();

        // Connect the target so it can receive the nudge.
        let (_conn, mut rx) = dir.router.register(target).await;

        // 3 -> 2 remaining crosses below the low-water mark of 3.
        dir.fetch_bundle(caller, target).await.unwrap();
        match rx.recv().await.unwrap() {
            PushEvent::ReplenishRequested { remaining } => assert_eq!(remaining, 2),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn fetch_establishes_the_callers_session() {
        let (dir, caller, target) = directory().await;
        dir.upload_prekeys(target, vec![prekey(1)]).await.unwrap();

        assert!(dir.sessions.ensure(caller, target).await.is_err());
        dir.fetch_bundle(caller, target).await.unwrap();
        assert!(dir.sessions.ensure(caller, target).await.is_ok());
    }

    #[tokio::test]
    async fn identity_re_registration_conflicts() {
        let (dir, _caller, target) = directory().await;
        dir.register_identity(target, "ik-target".into(), 42)
            .await
            .unwrap();
        let err = dir
            .register_identity(target, "ik-other".into(), 42)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::IdentityConflict(_)));
    }
}
