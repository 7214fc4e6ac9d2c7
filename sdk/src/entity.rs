//! Domain records gated by the Kernel.
//!
//! Divisions, agents, allocations and evals are stored as JSONB payloads
//! with a stable id; the Kernel does not constrain their shape beyond that.
//! Their meaning lives in the manifest signature and audit event emitted
//! alongside each insert.

use {
    crate::error::StoreError,
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    serde_json::Value,
    sqlx::{PgPool, Row as _},
    std::collections::HashMap,
    tokio::sync::Mutex,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Division,
    Agent,
    Allocation,
    Eval,
}

impl EntityKind {
    pub fn table(self) -> &'static str {
        match self {
            Self::Division => "divisions",
            Self::Agent => "agents",
            Self::Allocation => "allocations",
            Self::Eval => "evals",
        }
    }

    /// Audit event type emitted when a record of this kind is created.
    pub fn created_event(self) -> &'static str {
        match self {
            Self::Division => "division.created",
            Self::Agent => "agent.created",
            Self::Allocation => "allocation.created",
            Self::Eval => "eval.recorded",
        }
    }

    pub fn noun(self) -> &'static str {
        match self {
            Self::Division => "division",
            Self::Agent => "agent",
            Self::Allocation => "allocation",
            Self::Eval => "eval",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub id: String,
    pub kind: EntityKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert a record; duplicate ids within a kind are a conflict.
    async fn insert(&self, record: EntityRecord) -> Result<EntityRecord, StoreError>;

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, StoreError>;
}

#[derive(Default)]
pub struct MemoryEntityStore {
    records: Mutex<HashMap<(EntityKind, String), EntityRecord>>,
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for MemoryEntityStore {
    async fn insert(&self, record: EntityRecord) -> Result<EntityRecord, StoreError> {
        let mut records = self.records.lock().await;
        let key = (record.kind, record.id.clone());
        if records.contains_key(&key) {
            return Err(StoreError::Conflict(format!(
                "{} '{}' already exists",
                record.kind.noun(),
                record.id
            )));
        }
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .await
            .get(&(kind, id.to_string()))
            .cloned())
    }
}

pub struct PgEntityStore {
    pool: PgPool,
}

impl PgEntityStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EntityStore for PgEntityStore {
    async fn insert(&self, record: EntityRecord) -> Result<EntityRecord, StoreError> {
        // Table names come from the closed EntityKind enum, never from input.
        let query = format!(
            "INSERT INTO {} (id, payload, created_at) VALUES ($1, $2, $3)",
            record.kind.table()
        );
        let result = sqlx::query(&query)
            .bind(&record.id)
            .bind(&record.payload)
            .bind(record.created_at)
            .execute(&self.pool)
            .await;

        match result {
            Ok(_) => Ok(record),
            Err(err) if is_unique_violation(&err) => Err(StoreError::Conflict(format!(
                "{} '{}' already exists",
                record.kind.noun(),
                record.id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    async fn get(&self, kind: EntityKind, id: &str) -> Result<Option<EntityRecord>, StoreError> {
        let query = format!(
            "SELECT id, payload, created_at FROM {} WHERE id = $1",
            kind.table()
        );
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| {
            Ok(EntityRecord {
                id: row.try_get("id")?,
                kind,
                payload: row.try_get("payload")?,
                created_at: row.try_get("created_at")?,
            })
        })
        .transpose()
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == "23505")
}

#[cfg(test)]
mod tests {
    use {super::*, serde_json::json};

    #[tokio::test]
    async fn insert_and_get_roundtrip() {
        let store = MemoryEntityStore::new();
        let record = EntityRecord {
            id: "d1".into(),
            kind: EntityKind::Division,
            payload: json!({"name": "research"}),
            created_at: Utc::now(),
        };
        store.insert(record.clone()).await.unwrap();

        assert_eq!(
            store.get(EntityKind::Division, "d1").await.unwrap(),
            Some(record)
        );
        assert_eq!(store.get(EntityKind::Agent, "d1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn duplicate_id_within_a_kind_conflicts() {
        let store = MemoryEntityStore::new();
        let record = EntityRecord {
            id: "a1".into(),
            kind: EntityKind::Agent,
            payload: json!({"role": "worker"}),
            created_at: Utc::now(),
        };
        store.insert(record.clone()).await.unwrap();
        assert!(matches!(
            store.insert(record).await,
            Err(StoreError::Conflict(_))
        ));
    }
}
