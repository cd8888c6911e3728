//! Common test utilities for grants-service integration tests.

#![allow(dead_code)]

use chrono::{DateTime, SubsecRound, Utc};
use futures::FutureExt;
use grants_service::models::{Grant, GrantUse};
use grants_service::services::{
    GrantError, MemoryFactory, MongoFactory, PostgresFactory, Storer, StorerFactory,
};
use service_core::observability::init_test_tracing;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use uuid::Uuid;

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    init_test_tracing("info,grants_service=debug,sqlx=warn,mongodb=warn");
}

#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Postgres,
    Mongodb,
}

impl Backend {
    pub async fn factory(self) -> Box<dyn StorerFactory> {
        match self {
            Backend::Memory => Box::new(MemoryFactory),
            Backend::Postgres => {
                let url = std::env::var("TEST_DATABASE_URL")
                    .expect("TEST_DATABASE_URL must be set to run postgres storer tests");
                Box::new(
                    PostgresFactory::connect(&url)
                        .await
                        .expect("Failed to connect to test PostgreSQL server"),
                )
            }
            Backend::Mongodb => {
                let uri = std::env::var("TEST_MONGODB_URI")
                    .expect("TEST_MONGODB_URI must be set to run mongodb storer tests");
                Box::new(
                    MongoFactory::connect(&uri)
                        .await
                        .expect("Failed to connect to test MongoDB deployment"),
                )
            }
        }
    }
}

/// Run `test` against a fresh storer from `backend`, tearing the storer down
/// afterwards even if the test panics.
pub async fn run<F, Fut>(backend: Backend, test: F)
where
    F: FnOnce(Arc<dyn Storer>) -> Fut,
    Fut: Future<Output = ()>,
{
    init_tracing();

    let factory = backend.factory().await;
    let storer = factory
        .new_storer()
        .await
        .expect("Failed to create storer");

    let outcome = AssertUnwindSafe(test(storer)).catch_unwind().await;

    factory
        .teardown_storers()
        .await
        .expect("Failed to tear down storers");

    if let Err(panic) = outcome {
        std::panic::resume_unwind(panic);
    }
}

/// Current time at the millisecond precision every backend can store.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

/// A fully populated Active grant with a unique ID and source.
pub fn test_grant() -> Grant {
    let suffix = Uuid::new_v4().to_string();
    Grant {
        id: format!("grant-{}", suffix),
        source_type: "refresh_token".to_string(),
        source_id: format!("rt-{}", suffix),
        ancestor_ids: Vec::new(),
        created_at: now(),
        used_at: None,
        scopes: vec!["openid".to_string(), "profile".to_string()],
        account_id: "account-1".to_string(),
        profile_id: "profile-1".to_string(),
        client_id: "client-1".to_string(),
        create_ip: "203.0.113.7".to_string(),
        use_ip: String::new(),
        used: false,
        revoked: false,
    }
}

pub fn grant_use(id: &str, ip: &str) -> GrantUse {
    GrantUse {
        grant: id.to_string(),
        ip: ip.to_string(),
        time: now(),
    }
}

#[track_caller]
pub fn assert_not_found<T: std::fmt::Debug>(result: Result<T, GrantError>) {
    match result {
        Err(GrantError::NotFound) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
}
