//! Typed view of per-session records in the shared key/value store.
//!
//! Every session owns seven keys, `session:<id>:<field>`. The ownership
//! record is written separately from the others so a crash between the two
//! writes leaves a session that exists but cannot be routed to.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    auth::{AuthMode, Environment, SessionCredential},
    error::StoreError,
    store::KeyValueStore,
};

pub const KEY_PREFIX: &str = "session:";
pub const KEYS_PER_SESSION: usize = 7;

const FIELD_CONNECTION_STATE: &str = "connection_state";
const FIELD_LAST_ACTIVITY: &str = "last_activity";
const FIELD_ENVIRONMENT: &str = "environment";
const FIELD_AUTH_MODE: &str = "auth_mode";
const FIELD_CREDENTIAL: &str = "credential";
const FIELD_UI_SOURCE: &str = "ui_source";
const FIELD_OWNER: &str = "owner";

const ALL_FIELDS: [&str; KEYS_PER_SESSION] = [
    FIELD_CONNECTION_STATE,
    FIELD_LAST_ACTIVITY,
    FIELD_ENVIRONMENT,
    FIELD_AUTH_MODE,
    FIELD_CREDENTIAL,
    FIELD_UI_SOURCE,
    FIELD_OWNER,
];

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Which instance physically holds a session's socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub instance_id: String,
    pub address: String,
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_scheme() -> String {
    "http".to_string()
}

impl OwnerRecord {
    pub fn new(instance_id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            instance_id: instance_id.into(),
            address: address.into(),
            port,
            scheme: default_scheme(),
        }
    }

    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// The internal delivery endpoint of this instance.
    pub fn emit_url(&self) -> String {
        format!("{}://{}:{}/internal/emit", self.scheme, self.address, self.port)
    }
}

pub struct NewSession<'a> {
    pub session_id: &'a str,
    pub environment: Environment,
    pub credential: &'a SessionCredential,
    pub ui_source: Option<&'a str>,
    pub now_ms: i64,
}

/// Everything the directory holds for one session.
#[derive(Debug, Clone, Default)]
pub struct SessionRecord {
    pub connected: Option<bool>,
    pub last_activity_ms: Option<i64>,
    pub environment: Option<Environment>,
    pub credential: Option<SessionCredential>,
    pub ui_source: Option<String>,
    pub owner: Option<OwnerRecord>,
}

#[derive(Clone)]
pub struct SessionDirectory {
    store: Arc<dyn KeyValueStore>,
}

impl SessionDirectory {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(session_id: &str, field: &str) -> String {
        format!("{KEY_PREFIX}{session_id}:{field}")
    }

    /// Write the session state in one batch, then the ownership record.
    pub async fn register(&self, new: &NewSession<'_>, owner: &OwnerRecord) -> Result<(), StoreError> {
        let id = new.session_id;
        let entries = vec![
            (Self::key(id, FIELD_CONNECTION_STATE), "true".to_string()),
            (Self::key(id, FIELD_LAST_ACTIVITY), new.now_ms.to_string()),
            (Self::key(id, FIELD_ENVIRONMENT), new.environment.as_str().to_string()),
            (Self::key(id, FIELD_AUTH_MODE), new.credential.mode.as_str().to_string()),
            (Self::key(id, FIELD_CREDENTIAL), new.credential.value.clone()),
            (Self::key(id, FIELD_UI_SOURCE), new.ui_source.unwrap_or_default().to_string()),
        ];
        self.store.set_many(&entries).await?;

        let owner_json = serde_json::to_string(owner)
            .map_err(|error| StoreError::Unavailable(error.to_string()))?;
        self.store.set(&Self::key(id, FIELD_OWNER), &owner_json).await
    }

    pub async fn touch(&self, session_id: &str, now_ms: i64) -> Result<(), StoreError> {
        self.store
            .set(&Self::key(session_id, FIELD_LAST_ACTIVITY), &now_ms.to_string())
            .await
    }

    /// `None` when the directory has no record of the session.
    pub async fn connection_state(&self, session_id: &str) -> Result<Option<bool>, StoreError> {
        let key = Self::key(session_id, FIELD_CONNECTION_STATE);
        match self.store.get(&key).await? {
            None => Ok(None),
            Some(value) => parse_bool(&key, &value).map(Some),
        }
    }

    pub async fn owner(&self, session_id: &str) -> Result<Option<OwnerRecord>, StoreError> {
        let key = Self::key(session_id, FIELD_OWNER);
        match self.store.get(&key).await? {
            None => Ok(None),
            Some(raw) => parse_owner(&key, &raw).map(Some),
        }
    }

    /// The stored credential and environment used to re-run the gate.
    pub async fn session_auth(
        &self,
        session_id: &str,
    ) -> Result<Option<(SessionCredential, Environment)>, StoreError> {
        let keys = vec![
            Self::key(session_id, FIELD_AUTH_MODE),
            Self::key(session_id, FIELD_CREDENTIAL),
            Self::key(session_id, FIELD_ENVIRONMENT),
        ];
        let mut values = self.store.get_many(&keys).await?.into_iter();
        let (Some(Some(mode)), Some(Some(value)), Some(env)) =
            (values.next(), values.next(), values.next())
        else {
            return Ok(None);
        };
        let mode: AuthMode = mode.parse().map_err(|_| StoreError::InvalidValue {
            key: keys[0].clone(),
            value: mode.clone(),
        })?;
        let env = env
            .as_deref()
            .map(Environment::parse_lenient)
            .unwrap_or(Environment::DEFAULT);
        Ok(Some((SessionCredential { mode, value }, env)))
    }

    pub async fn record(&self, session_id: &str) -> Result<Option<SessionRecord>, StoreError> {
        let keys: Vec<String> = ALL_FIELDS
            .iter()
            .map(|field| Self::key(session_id, field))
            .collect();
        let values = self.store.get_many(&keys).await?;
        if values.iter().all(Option::is_none) {
            return Ok(None);
        }

        let field = |name: &str| -> Option<&String> {
            ALL_FIELDS
                .iter()
                .position(|candidate| *candidate == name)
                .and_then(|idx| values[idx].as_ref())
        };

        let mut record = SessionRecord::default();
        if let Some(raw) = field(FIELD_CONNECTION_STATE) {
            record.connected = Some(parse_bool(&keys[0], raw)?);
        }
        record.last_activity_ms = field(FIELD_LAST_ACTIVITY).and_then(|raw| raw.parse().ok());
        record.environment = field(FIELD_ENVIRONMENT).map(|raw| Environment::parse_lenient(raw));
        if let (Some(mode), Some(value)) = (field(FIELD_AUTH_MODE), field(FIELD_CREDENTIAL)) {
            if let Ok(mode) = mode.parse() {
                record.credential = Some(SessionCredential {
                    mode,
                    value: value.clone(),
                });
            }
        }
        record.ui_source = field(FIELD_UI_SOURCE)
            .filter(|raw| !raw.is_empty())
            .cloned();
        if let Some(raw) = field(FIELD_OWNER) {
            record.owner = Some(parse_owner(&keys[6], raw)?);
        }
        Ok(Some(record))
    }

    /// Delete every key of the session. Safe to call repeatedly.
    pub async fn purge(&self, session_id: &str) -> Result<usize, StoreError> {
        let keys: Vec<String> = ALL_FIELDS
            .iter()
            .map(|field| Self::key(session_id, field))
            .collect();
        self.store.delete(&keys).await
    }

    /// Sessions whose last activity is older than `max_age`, plus sessions
    /// left without an activity timestamp at all.
    pub async fn stale_sessions(&self, max_age: Duration, now_ms: i64) -> Result<Vec<String>, StoreError> {
        let keys = self.store.keys_with_prefix(KEY_PREFIX).await?;

        let mut sessions: BTreeMap<String, bool> = BTreeMap::new();
        for key in &keys {
            if let Some((id, field)) = split_key(key) {
                let has_activity = sessions.entry(id.to_string()).or_insert(false);
                *has_activity |= field == FIELD_LAST_ACTIVITY;
            }
        }

        let tracked: Vec<String> = sessions
            .iter()
            .filter(|(_, has_activity)| **has_activity)
            .map(|(id, _)| id.clone())
            .collect();
        let activity_keys: Vec<String> = tracked
            .iter()
            .map(|id| Self::key(id, FIELD_LAST_ACTIVITY))
            .collect();
        let stamps = self.store.get_many(&activity_keys).await?;

        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        let mut stale: Vec<String> = sessions
            .iter()
            .filter(|(_, has_activity)| !**has_activity)
            .map(|(id, _)| id.clone())
            .collect();
        for (id, stamp) in tracked.into_iter().zip(stamps) {
            let expired = match stamp.as_deref().map(str::parse::<i64>) {
                Some(Ok(last)) => now_ms.saturating_sub(last) > max_age_ms,
                Some(Err(_)) => true,
                // Removed between the scan and the read.
                None => false,
            };
            if expired {
                stale.push(id);
            }
        }
        stale.sort();
        Ok(stale)
    }

    /// Heuristic: relay key count divided by the per-session fan-out.
    pub async fn approx_sessions(&self) -> Result<usize, StoreError> {
        Ok(self.store.keys_with_prefix(KEY_PREFIX).await?.len() / KEYS_PER_SESSION)
    }

    pub async fn ping(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    pub async fn reconnect(&self) -> Result<(), StoreError> {
        self.store.reconnect().await
    }

    pub fn describe(&self) -> String {
        self.store.describe()
    }
}

fn split_key(key: &str) -> Option<(&str, &str)> {
    key.strip_prefix(KEY_PREFIX)?.rsplit_once(':')
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, StoreError> {
    match raw {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(StoreError::InvalidValue {
            key: key.to_string(),
            value: other.to_string(),
        }),
    }
}

fn parse_owner(key: &str, raw: &str) -> Result<OwnerRecord, StoreError> {
    serde_json::from_str(raw).map_err(|_| StoreError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::{NewSession, OwnerRecord, SessionDirectory};
    use crate::{
        auth::{AuthMode, Environment, SessionCredential},
        store::{KeyValueStore, MemoryStore},
    };

    fn credential() -> SessionCredential {
        SessionCredential {
            mode: AuthMode::Secret,
            value: "s3cret".into(),
        }
    }

    async fn register(dir: &SessionDirectory, id: &str, now_ms: i64) {
        let credential = credential();
        dir.register(
            &NewSession {
                session_id: id,
                environment: Environment::Dev,
                credential: &credential,
                ui_source: Some("slack"),
                now_ms,
            },
            &OwnerRecord::new("server_a", "10.0.0.1", 3004),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn register_writes_seven_keys_and_owner() {
        let store = Arc::new(MemoryStore::new());
        let dir = SessionDirectory::new(store.clone());
        register(&dir, "s1", 1_000).await;

        assert_eq!(store.len(), 7);
        assert_eq!(dir.connection_state("s1").await.unwrap(), Some(true));
        let owner = dir.owner("s1").await.unwrap().unwrap();
        assert_eq!(owner.instance_id, "server_a");
        assert_eq!(owner.emit_url(), "http://10.0.0.1:3004/internal/emit");
        assert_eq!(dir.approx_sessions().await.unwrap(), 1);

        let (stored, env) = dir.session_auth("s1").await.unwrap().unwrap();
        assert_eq!(stored, credential());
        assert_eq!(env, Environment::Dev);
    }

    #[tokio::test]
    async fn purge_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let dir = SessionDirectory::new(store.clone());
        register(&dir, "s1", 1_000).await;

        assert_eq!(dir.purge("s1").await.unwrap(), 7);
        assert_eq!(dir.purge("s1").await.unwrap(), 0);
        assert!(store.is_empty());
        assert_eq!(dir.connection_state("s1").await.unwrap(), None);
        assert!(dir.record("s1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_sessions_respect_threshold() {
        let store = Arc::new(MemoryStore::new());
        let dir = SessionDirectory::new(store.clone());
        register(&dir, "old", 0).await;
        register(&dir, "fresh", 9_000).await;
        register(&dir, "edge", 5_000).await;

        let stale = dir
            .stale_sessions(Duration::from_millis(5_000), 10_000)
            .await
            .unwrap();
        assert_eq!(stale, vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn orphaned_owner_record_is_reported_stale() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("session:ghost:owner", r#"{"instance_id":"x","address":"a","port":1}"#)
            .await
            .unwrap();
        let dir = SessionDirectory::new(store);
        let stale = dir.stale_sessions(Duration::from_secs(60), 0).await.unwrap();
        assert_eq!(stale, vec!["ghost".to_string()]);
    }

    #[tokio::test]
    async fn session_ids_may_contain_colons() {
        let store = Arc::new(MemoryStore::new());
        let dir = SessionDirectory::new(store);
        register(&dir, "team:42", 0).await;
        let stale = dir.stale_sessions(Duration::from_millis(1), 10).await.unwrap();
        assert_eq!(stale, vec!["team:42".to_string()]);
    }

    #[tokio::test]
    async fn state_without_owner_is_present_but_unroutable() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("session:s9:connection_state", "true")
            .await
            .unwrap();
        let dir = SessionDirectory::new(store);
        assert_eq!(dir.connection_state("s9").await.unwrap(), Some(true));
        assert_eq!(dir.owner("s9").await.unwrap(), None);
    }
}
