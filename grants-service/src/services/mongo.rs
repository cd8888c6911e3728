//! MongoDB grant storer.
//!
//! Grants live in the `grants` collection keyed by grant ID. Each grant also
//! owns a document in `grant_sources` whose `_id` is its
//! `{source_type, source_id}` pair; the unique `_id` index on both
//! collections is what rejects duplicates. Multi-document writes run in
//! replica-set transactions, so a MongoDB deployment without transactions
//! (a standalone server) is not supported.

use crate::config::MongoConfig;
use crate::models::{Grant, GrantUse};
use crate::services::error::GrantError;
use crate::services::metrics::observe_operation;
use crate::services::storer::{ensure_active, ensure_creatable, Storer, StorerFactory};
use async_trait::async_trait;
use mongodb::{
    bson::{doc, DateTime as BsonDateTime},
    error::{ErrorKind, WriteFailure, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    options::IndexOptions,
    Client as MongoClient, ClientSession, Collection, Database, IndexModel,
};
use serde::{Deserialize, Serialize};
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, instrument, warn};

const BACKEND: &str = "mongodb";

const DUPLICATE_KEY: i32 = 11000;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GrantDocument {
    #[serde(rename = "_id")]
    id: String,
    source_type: String,
    source_id: String,
    #[serde(default)]
    ancestor_ids: Vec<String>,
    created_at: BsonDateTime,
    used_at: Option<BsonDateTime>,
    #[serde(default)]
    scopes: Vec<String>,
    account_id: String,
    profile_id: String,
    client_id: String,
    create_ip: String,
    use_ip: String,
    used: bool,
    revoked: bool,
}

impl From<&Grant> for GrantDocument {
    fn from(grant: &Grant) -> Self {
        Self {
            id: grant.id.clone(),
            source_type: grant.source_type.clone(),
            source_id: grant.source_id.clone(),
            ancestor_ids: grant.ancestor_ids.clone(),
            created_at: BsonDateTime::from_chrono(grant.created_at),
            used_at: grant.used_at.map(BsonDateTime::from_chrono),
            scopes: grant.scopes.clone(),
            account_id: grant.account_id.clone(),
            profile_id: grant.profile_id.clone(),
            client_id: grant.client_id.clone(),
            create_ip: grant.create_ip.clone(),
            use_ip: grant.use_ip.clone(),
            used: grant.used,
            revoked: grant.revoked,
        }
    }
}

impl From<GrantDocument> for Grant {
    fn from(doc: GrantDocument) -> Self {
        Self {
            id: doc.id,
            source_type: doc.source_type,
            source_id: doc.source_id,
            ancestor_ids: doc.ancestor_ids,
            created_at: doc.created_at.to_chrono(),
            used_at: doc.used_at.map(|t| t.to_chrono()),
            scopes: doc.scopes,
            account_id: doc.account_id,
            profile_id: doc.profile_id,
            client_id: doc.client_id,
            create_ip: doc.create_ip,
            use_ip: doc.use_ip,
            used: doc.used,
            revoked: doc.revoked,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SourceKey {
    source_type: String,
    source_id: String,
}

/// Claims a `(source_type, source_id)` pair for one grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SourceRecord {
    #[serde(rename = "_id")]
    id: SourceKey,
    grant_id: String,
}

impl SourceRecord {
    fn of(grant: &Grant) -> Self {
        Self {
            id: SourceKey {
                source_type: grant.source_type.clone(),
                source_id: grant.source_id.clone(),
            },
            grant_id: grant.id.clone(),
        }
    }
}

/// Outcome of one transaction attempt. Only driver errors labelled
/// transient are worth another attempt.
#[derive(Debug)]
enum TxnError {
    Grant(GrantError),
    Mongo(mongodb::error::Error),
}

impl TxnError {
    fn is_transient(&self) -> bool {
        match self {
            TxnError::Mongo(e) => e.contains_label(TRANSIENT_TRANSACTION_ERROR),
            TxnError::Grant(_) => false,
        }
    }
}

impl fmt::Display for TxnError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnError::Grant(e) => write!(f, "{}", e),
            TxnError::Mongo(e) => write!(f, "{}", e),
        }
    }
}

impl From<TxnError> for GrantError {
    fn from(err: TxnError) -> Self {
        match err {
            TxnError::Grant(e) => e,
            TxnError::Mongo(e) => GrantError::backend(e),
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(we)) => we.code == DUPLICATE_KEY,
        ErrorKind::Command(ce) => ce.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// Map a driver error onto the grant error taxonomy. `on_duplicate` names
/// the domain error a duplicate key means for the write that failed.
fn translate_error(err: mongodb::error::Error, on_duplicate: Option<GrantError>) -> TxnError {
    match on_duplicate {
        Some(domain) if is_duplicate_key(&err) => TxnError::Grant(domain),
        _ => TxnError::Mongo(err),
    }
}

/// MongoDB-backed storer scoped to one database.
#[derive(Clone)]
pub struct MongoStorer {
    client: MongoClient,
    db: Database,
    retry: RetryConfig,
}

impl MongoStorer {
    /// Use `database` on an existing client. Many storers may share one
    /// client, each isolated in its own database.
    pub fn new(client: MongoClient, database: &str, max_transaction_retries: u32) -> Self {
        let db = client.database(database);
        Self {
            client,
            db,
            retry: RetryConfig::transaction(max_transaction_retries),
        }
    }

    pub async fn connect(config: &MongoConfig) -> Result<Self, GrantError> {
        info!("Connecting to MongoDB");
        let client = MongoClient::with_uri_str(&config.uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            GrantError::backend(e)
        })?;
        info!(database = %config.database, "Successfully connected to MongoDB database");
        Ok(Self::new(
            client,
            &config.database,
            config.max_transaction_retries,
        ))
    }

    /// Create the collections and their secondary indexes. Transactions
    /// cannot create collections on older servers, so run this before
    /// serving traffic.
    pub async fn initialize_indexes(&self) -> Result<(), GrantError> {
        info!("Creating MongoDB indexes for grants-service");

        let source_index = IndexModel::builder()
            .keys(doc! { "source_type": 1, "source_id": 1 })
            .options(IndexOptions::builder().name("source_idx".to_string()).build())
            .build();
        self.grants()
            .create_index(source_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create source index: {}", e);
                GrantError::backend(e)
            })?;

        let grant_id_index = IndexModel::builder()
            .keys(doc! { "grant_id": 1 })
            .options(IndexOptions::builder().name("grant_id_idx".to_string()).build())
            .build();
        self.sources()
            .create_index(grant_id_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create grant_id index: {}", e);
                GrantError::backend(e)
            })?;

        info!("MongoDB indexes created");
        Ok(())
    }

    fn grants(&self) -> Collection<GrantDocument> {
        self.db.collection("grants")
    }

    fn sources(&self) -> Collection<SourceRecord> {
        self.db.collection("grant_sources")
    }

    async fn start_transaction(&self) -> Result<ClientSession, TxnError> {
        let mut session = self
            .client
            .start_session(None)
            .await
            .map_err(TxnError::Mongo)?;
        session
            .start_transaction(None)
            .await
            .map_err(TxnError::Mongo)?;
        Ok(session)
    }

    /// Commit, retrying while the server cannot say whether the commit
    /// landed. Commits are idempotent.
    async fn commit(&self, session: &mut ClientSession) -> Result<(), TxnError> {
        let mut attempt = 0;
        loop {
            match session.commit_transaction().await {
                Err(e)
                    if e.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                        && attempt < self.retry.max_retries =>
                {
                    warn!(attempt = attempt + 1, error = %e, "Commit result unknown, retrying commit");
                    attempt += 1;
                }
                result => return result.map_err(TxnError::Mongo),
            }
        }
    }

    // Dropping a session with an open transaction aborts it, so the early
    // returns below leave nothing behind.

    async fn try_insert(&self, grant: &Grant) -> Result<(), TxnError> {
        let mut session = self.start_transaction().await?;

        self.grants()
            .insert_one_with_session(GrantDocument::from(grant), None, &mut session)
            .await
            .map_err(|e| translate_error(e, Some(GrantError::AlreadyExists)))?;

        self.sources()
            .insert_one_with_session(SourceRecord::of(grant), None, &mut session)
            .await
            .map_err(|e| translate_error(e, Some(GrantError::SourceAlreadyUsed)))?;

        self.commit(&mut session).await
    }

    async fn try_transition<F>(&self, id: &str, update: &F) -> Result<Grant, TxnError>
    where
        F: Fn(Grant) -> Grant + Sync,
    {
        let mut session = self.start_transaction().await?;

        let current: Grant = self
            .grants()
            .find_one_with_session(doc! { "_id": id }, None, &mut session)
            .await
            .map_err(|e| translate_error(e, None))?
            .ok_or(TxnError::Grant(GrantError::NotFound))?
            .into();
        ensure_active(&current).map_err(TxnError::Grant)?;

        let updated = update(current);
        self.grants()
            .replace_one_with_session(
                doc! { "_id": id },
                GrantDocument::from(&updated),
                None,
                &mut session,
            )
            .await
            .map_err(|e| translate_error(e, None))?;

        self.commit(&mut session).await?;
        Ok(updated)
    }

    async fn insert(&self, grant: &Grant) -> Result<(), GrantError> {
        retry_with_backoff(&self.retry, "create_grant", TxnError::is_transient, || {
            self.try_insert(grant)
        })
        .await
        .map_err(GrantError::from)
    }

    async fn transition<F>(&self, id: &str, operation: &str, update: F) -> Result<Grant, GrantError>
    where
        F: Fn(Grant) -> Grant + Sync,
    {
        let update = &update;
        retry_with_backoff(&self.retry, operation, TxnError::is_transient, || {
            self.try_transition(id, update)
        })
        .await
        .map_err(GrantError::from)
    }

    async fn find_grant(&self, filter: mongodb::bson::Document) -> Result<Grant, GrantError> {
        self.grants()
            .find_one(filter, None)
            .await
            .map_err(GrantError::backend)?
            .map(Grant::from)
            .ok_or(GrantError::NotFound)
    }
}

#[async_trait]
impl Storer for MongoStorer {
    #[instrument(
        skip(self, grant),
        fields(grant = %grant.id, source_type = %grant.source_type, source_id = %grant.source_id)
    )]
    async fn create_grant(&self, grant: Grant) -> Result<(), GrantError> {
        observe_operation(BACKEND, "create_grant", async {
            ensure_creatable(&grant)?;
            self.insert(&grant).await
        })
        .await
    }

    #[instrument(skip(self, grant_use), fields(grant = %grant_use.grant))]
    async fn exchange_grant(&self, grant_use: GrantUse) -> Result<Grant, GrantError> {
        observe_operation(
            BACKEND,
            "exchange_grant",
            self.transition(&grant_use.grant, "exchange_grant", |grant| {
                grant_use.apply(grant)
            }),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn revoke_grant(&self, id: &str) -> Result<Grant, GrantError> {
        observe_operation(
            BACKEND,
            "revoke_grant",
            self.transition(id, "revoke_grant", |mut grant| {
                grant.revoked = true;
                grant
            }),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn get_grant(&self, id: &str) -> Result<Grant, GrantError> {
        observe_operation(BACKEND, "get_grant", self.find_grant(doc! { "_id": id })).await
    }

    #[instrument(skip(self))]
    async fn get_grant_by_source(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> Result<Grant, GrantError> {
        observe_operation(
            BACKEND,
            "get_grant_by_source",
            self.find_grant(doc! { "source_type": source_type, "source_id": source_id }),
        )
        .await
    }

    async fn health_check(&self) -> Result<(), GrantError> {
        self.db
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| GrantError::backend(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }
}

/// Hands out storers in fresh `grants_test_<hex>` databases on one client
/// and drops those databases on teardown.
pub struct MongoFactory {
    client: MongoClient,
    databases: Mutex<Vec<String>>,
}

impl MongoFactory {
    pub async fn connect(uri: &str) -> Result<Self, GrantError> {
        let client = MongoClient::with_uri_str(uri)
            .await
            .map_err(GrantError::backend)?;
        Ok(Self {
            client,
            databases: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl StorerFactory for MongoFactory {
    async fn new_storer(&self) -> Result<Arc<dyn Storer>, GrantError> {
        let suffix: [u8; 6] = rand::random();
        let name = format!("grants_test_{}", hex::encode(suffix));

        let storer = MongoStorer::new(self.client.clone(), &name, 10);
        self.databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(name);
        storer.initialize_indexes().await?;
        Ok(Arc::new(storer))
    }

    async fn teardown_storers(&self) -> Result<(), GrantError> {
        let databases =
            std::mem::take(&mut *self.databases.lock().unwrap_or_else(PoisonError::into_inner));
        for name in databases {
            self.client
                .database(&name)
                .drop(None)
                .await
                .map_err(GrantError::backend)?;
        }
        Ok(())
    }
}
