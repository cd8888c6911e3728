//! PostgreSQL grant storer.
//!
//! Uniqueness comes from table constraints and the Active → Used/Revoked
//! transition from a conditional `UPDATE`: the database lets exactly one of
//! any number of racing updates touch the row, and `RETURNING` tells us
//! whether ours was it. No application-side locking is involved.

use crate::config::DatabaseConfig;
use crate::models::{Grant, GrantUse};
use crate::services::error::GrantError;
use crate::services::metrics::observe_operation;
use crate::services::storer::{ensure_creatable, Storer, StorerFactory};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::query::QueryAs;
use sqlx::{FromRow, Postgres};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, instrument};

const BACKEND: &str = "postgres";

const GRANTS_PKEY: &str = "grants_pkey";
const GRANTS_SOURCE_KEY: &str = "grants_source_type_source_id_key";

macro_rules! grant_columns {
    () => {
        "id, source_type, source_id, created_at, used_at, scopes, account_id, profile_id, \
         client_id, create_ip, use_ip, used, revoked"
    };
}

const INSERT_GRANT: &str = concat!(
    "INSERT INTO grants (",
    grant_columns!(),
    ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
);

const INSERT_ANCESTORS: &str = r#"
    INSERT INTO grants_ancestors (grant_id, ancestor_id, position)
    SELECT $1, ancestor.id, ancestor.position
    FROM UNNEST($2::TEXT[]) WITH ORDINALITY AS ancestor(id, position)
"#;

const SELECT_GRANT_BY_ID: &str = concat!("SELECT ", grant_columns!(), " FROM grants WHERE id = $1");

const SELECT_GRANT_BY_SOURCE: &str = concat!(
    "SELECT ",
    grant_columns!(),
    " FROM grants WHERE source_type = $1 AND source_id = $2"
);

const SELECT_ANCESTORS: &str =
    "SELECT ancestor_id FROM grants_ancestors WHERE grant_id = $1 ORDER BY position";

const EXCHANGE_GRANT: &str = concat!(
    "UPDATE grants SET used = TRUE, use_ip = $2, used_at = $3 ",
    "WHERE id = $1 AND used = FALSE AND revoked = FALSE RETURNING ",
    grant_columns!()
);

const REVOKE_GRANT: &str = concat!(
    "UPDATE grants SET revoked = TRUE ",
    "WHERE id = $1 AND used = FALSE AND revoked = FALSE RETURNING ",
    grant_columns!()
);

/// Row shape of the `grants` table.
#[derive(Debug, Clone, FromRow)]
struct GrantRow {
    id: String,
    source_type: String,
    source_id: String,
    created_at: DateTime<Utc>,
    used_at: Option<DateTime<Utc>>,
    scopes: Vec<String>,
    account_id: String,
    profile_id: String,
    client_id: String,
    create_ip: String,
    use_ip: String,
    used: bool,
    revoked: bool,
}

impl GrantRow {
    fn into_grant(self, ancestor_ids: Vec<String>) -> Grant {
        Grant {
            id: self.id,
            source_type: self.source_type,
            source_id: self.source_id,
            ancestor_ids,
            created_at: self.created_at,
            used_at: self.used_at,
            scopes: self.scopes,
            account_id: self.account_id,
            profile_id: self.profile_id,
            client_id: self.client_id,
            create_ip: self.create_ip,
            use_ip: self.use_ip,
            used: self.used,
            revoked: self.revoked,
        }
    }
}

/// Map a sqlx error onto the grant error taxonomy. The only place
/// PostgreSQL error details are inspected.
fn translate_error(err: sqlx::Error) -> GrantError {
    if let sqlx::Error::Database(ref db_err) = err {
        if db_err.is_unique_violation() {
            match db_err.constraint() {
                Some(GRANTS_PKEY) => return GrantError::AlreadyExists,
                Some(GRANTS_SOURCE_KEY) => return GrantError::SourceAlreadyUsed,
                _ => {}
            }
        }
    }
    GrantError::backend(err)
}

/// Explain why a conditional state update matched no row, given the row as
/// read afterwards.
fn explain_no_update(current: Option<Grant>, id: &str, operation: &str) -> GrantError {
    match current {
        None => GrantError::NotFound,
        Some(grant) if grant.used => GrantError::AlreadyUsed,
        Some(grant) if grant.revoked => GrantError::Revoked,
        Some(_) => GrantError::backend(anyhow::anyhow!(
            "error {} {}: no grants updated, grant found, grant not used or revoked",
            operation,
            id
        )),
    }
}

/// PostgreSQL-backed storer. Cloning shares the pool.
#[derive(Clone)]
pub struct PostgresStorer {
    pool: PgPool,
}

impl PostgresStorer {
    /// Wrap an existing pool. The schema must already be migrated.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a connection pool and wrap it.
    #[instrument(skip(config), fields(service = "grants-service"))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, GrantError> {
        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.url)
            .await
            .map_err(|e| GrantError::backend(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the `grants` and `grants_ancestors` tables.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), GrantError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| GrantError::backend(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_ancestors(&self, id: &str) -> Result<Vec<String>, GrantError> {
        sqlx::query_scalar::<_, String>(SELECT_ANCESTORS)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(translate_error)
    }

    async fn with_ancestors(&self, row: Option<GrantRow>) -> Result<Option<Grant>, GrantError> {
        match row {
            Some(row) => {
                let ancestors = self.fetch_ancestors(&row.id).await?;
                Ok(Some(row.into_grant(ancestors)))
            }
            None => Ok(None),
        }
    }

    async fn fetch_grant(&self, id: &str) -> Result<Option<Grant>, GrantError> {
        let row = sqlx::query_as::<_, GrantRow>(SELECT_GRANT_BY_ID)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(translate_error)?;
        self.with_ancestors(row).await
    }

    async fn insert(&self, grant: &Grant) -> Result<(), GrantError> {
        let mut tx = self.pool.begin().await.map_err(translate_error)?;

        sqlx::query(INSERT_GRANT)
            .bind(&grant.id)
            .bind(&grant.source_type)
            .bind(&grant.source_id)
            .bind(grant.created_at)
            .bind(grant.used_at)
            .bind(&grant.scopes)
            .bind(&grant.account_id)
            .bind(&grant.profile_id)
            .bind(&grant.client_id)
            .bind(&grant.create_ip)
            .bind(&grant.use_ip)
            .bind(grant.used)
            .bind(grant.revoked)
            .execute(&mut *tx)
            .await
            .map_err(translate_error)?;

        if !grant.ancestor_ids.is_empty() {
            sqlx::query(INSERT_ANCESTORS)
                .bind(&grant.id)
                .bind(&grant.ancestor_ids)
                .execute(&mut *tx)
                .await
                .map_err(translate_error)?;
        }

        tx.commit().await.map_err(translate_error)?;
        Ok(())
    }

    /// Run a conditional state update. When it matches no row, read the
    /// row back to explain why.
    async fn transition(
        &self,
        id: &str,
        operation: &str,
        update: QueryAs<'_, Postgres, GrantRow, PgArguments>,
    ) -> Result<Grant, GrantError> {
        let updated = update
            .fetch_optional(&self.pool)
            .await
            .map_err(translate_error)?;
        if let Some(row) = updated {
            let ancestors = self.fetch_ancestors(id).await?;
            return Ok(row.into_grant(ancestors));
        }

        debug!(grant = %id, operation, "Conditional grant update matched no rows");
        let current = self.fetch_grant(id).await?;
        Err(explain_no_update(current, id, operation))
    }
}

#[async_trait]
impl Storer for PostgresStorer {
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
        let update = sqlx::query_as::<_, GrantRow>(EXCHANGE_GRANT)
            .bind(&grant_use.grant)
            .bind(&grant_use.ip)
            .bind(grant_use.time);
        observe_operation(
            BACKEND,
            "exchange_grant",
            self.transition(&grant_use.grant, "exchanging", update),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn revoke_grant(&self, id: &str) -> Result<Grant, GrantError> {
        let update = sqlx::query_as::<_, GrantRow>(REVOKE_GRANT).bind(id);
        observe_operation(BACKEND, "revoke_grant", self.transition(id, "revoking", update)).await
    }

    #[instrument(skip(self))]
    async fn get_grant(&self, id: &str) -> Result<Grant, GrantError> {
        observe_operation(BACKEND, "get_grant", async {
            self.fetch_grant(id).await?.ok_or(GrantError::NotFound)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn get_grant_by_source(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> Result<Grant, GrantError> {
        observe_operation(BACKEND, "get_grant_by_source", async {
            let row = sqlx::query_as::<_, GrantRow>(SELECT_GRANT_BY_SOURCE)
                .bind(source_type)
                .bind(source_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(translate_error)?;
            self.with_ancestors(row).await?.ok_or(GrantError::NotFound)
        })
        .await
    }

    async fn health_check(&self) -> Result<(), GrantError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| GrantError::backend(anyhow::anyhow!("Health check failed: {}", e)))?;
        Ok(())
    }
}

/// Creates a throwaway database per storer on the server named by
/// `admin_url` and drops them all on teardown.
pub struct PostgresFactory {
    admin: PgPool,
    options: PgConnectOptions,
    databases: Mutex<Vec<(String, PgPool)>>,
}

impl PostgresFactory {
    pub async fn connect(admin_url: &str) -> Result<Self, GrantError> {
        let options = PgConnectOptions::from_str(admin_url).map_err(GrantError::backend)?;
        let admin = PgPoolOptions::new()
            .max_connections(2)
            .connect_with(options.clone())
            .await
            .map_err(GrantError::backend)?;
        Ok(Self {
            admin,
            options,
            databases: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl StorerFactory for PostgresFactory {
    async fn new_storer(&self) -> Result<Arc<dyn Storer>, GrantError> {
        let suffix: [u8; 6] = rand::random();
        let name = format!("grants_test_{}", hex::encode(suffix));

        sqlx::query(&format!("CREATE DATABASE {}", name))
            .execute(&self.admin)
            .await
            .map_err(GrantError::backend)?;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_with(self.options.clone().database(&name))
            .await
            .map_err(GrantError::backend)?;

        self.databases
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((name.clone(), pool.clone()));

        let storer = PostgresStorer::new(pool);
        storer.run_migrations().await?;
        debug!(database = %name, "Provisioned test database");
        Ok(Arc::new(storer))
    }

    async fn teardown_storers(&self) -> Result<(), GrantError> {
        let databases =
            std::mem::take(&mut *self.databases.lock().unwrap_or_else(PoisonError::into_inner));
        for (name, pool) in databases {
            pool.close().await;
            sqlx::query(&format!("DROP DATABASE IF EXISTS {}", name))
                .execute(&self.admin)
                .await
                .map_err(GrantError::backend)?;
        }
        self.admin.close().await;
        Ok(())
    }
}
