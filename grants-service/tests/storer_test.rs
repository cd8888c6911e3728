//! Storer conformance tests.
//!
//! Every check runs against each backend. The memory backend always runs;
//! the postgres and mongodb variants are ignored by default and need
//! `TEST_DATABASE_URL` / `TEST_MONGODB_URI` (run with `--ignored`).

mod common;

use common::{assert_not_found, grant_use, now, test_grant};
use futures::future::join_all;
use grants_service::models::{Grant, GrantUse};
use grants_service::services::{GrantError, Storer};
use std::sync::Arc;

const CONCURRENT_ATTEMPTS: usize = 16;

macro_rules! storer_tests {
    ($($name:ident),* $(,)?) => {
        mod memory {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $name() {
                    crate::common::run(crate::common::Backend::Memory, super::$name).await;
                }
            )*
        }

        mod postgres {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                #[ignore]
                async fn $name() {
                    crate::common::run(crate::common::Backend::Postgres, super::$name).await;
                }
            )*
        }

        mod mongodb {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                #[ignore]
                async fn $name() {
                    crate::common::run(crate::common::Backend::Mongodb, super::$name).await;
                }
            )*
        }
    };
}

storer_tests!(
    create_and_get_by_id_and_source,
    ancestor_order_is_preserved,
    duplicate_id_fails,
    duplicate_source_fails,
    duplicate_id_takes_precedence_over_source,
    failed_create_leaves_no_trace,
    terminal_grants_cannot_be_created,
    source_lookup_is_exact,
    get_missing_grant,
    exchange_succeeds_once,
    exchange_missing_grant,
    revoke_succeeds_once,
    revoke_missing_grant,
    used_grant_cannot_be_revoked,
    concurrent_exchanges_have_one_winner,
    concurrent_creates_claim_source_once,
    exchange_races_revoke,
    manual_grant_scenario,
);

async fn create_and_get_by_id_and_source(storer: Arc<dyn Storer>) {
    let mut grant = test_grant();
    grant.ancestor_ids = vec!["ancestor-1".to_string(), "ancestor-2".to_string()];

    storer
        .create_grant(grant.clone())
        .await
        .expect("Failed to create grant");

    let by_id = storer.get_grant(&grant.id).await.expect("Failed to get grant");
    assert_eq!(by_id, grant);

    let by_source = storer
        .get_grant_by_source(&grant.source_type, &grant.source_id)
        .await
        .expect("Failed to get grant by source");
    assert_eq!(by_source, grant);
}

async fn ancestor_order_is_preserved(storer: Arc<dyn Storer>) {
    let mut grant = test_grant();
    grant.ancestor_ids = vec![
        "zeta".to_string(),
        "alpha".to_string(),
        "mu".to_string(),
        "beta".to_string(),
    ];
    storer.create_grant(grant.clone()).await.unwrap();

    let stored = storer.get_grant(&grant.id).await.unwrap();
    assert_eq!(stored.ancestor_ids, grant.ancestor_ids);
}

async fn duplicate_id_fails(storer: Arc<dyn Storer>) {
    let first = test_grant();
    storer.create_grant(first.clone()).await.unwrap();

    let duplicate = Grant {
        id: first.id.clone(),
        ..test_grant()
    };
    let err = storer.create_grant(duplicate).await.unwrap_err();
    assert!(matches!(err, GrantError::AlreadyExists), "got {:?}", err);

    // the original is untouched
    assert_eq!(storer.get_grant(&first.id).await.unwrap(), first);
}

async fn duplicate_source_fails(storer: Arc<dyn Storer>) {
    let first = test_grant();
    storer.create_grant(first.clone()).await.unwrap();

    let replay = Grant {
        source_type: first.source_type.clone(),
        source_id: first.source_id.clone(),
        ..test_grant()
    };
    let err = storer.create_grant(replay).await.unwrap_err();
    assert!(matches!(err, GrantError::SourceAlreadyUsed), "got {:?}", err);
}

async fn duplicate_id_takes_precedence_over_source(storer: Arc<dyn Storer>) {
    let first = test_grant();
    storer.create_grant(first.clone()).await.unwrap();

    let err = storer.create_grant(first.clone()).await.unwrap_err();
    assert!(matches!(err, GrantError::AlreadyExists), "got {:?}", err);
}

async fn failed_create_leaves_no_trace(storer: Arc<dyn Storer>) {
    let first = test_grant();
    storer.create_grant(first.clone()).await.unwrap();

    let replay = Grant {
        source_type: first.source_type.clone(),
        source_id: first.source_id.clone(),
        ..test_grant()
    };
    let replay_id = replay.id.clone();
    storer.create_grant(replay).await.unwrap_err();
    assert_not_found(storer.get_grant(&replay_id).await);

    // a grant colliding on ID must not claim its source
    let colliding = Grant {
        id: first.id.clone(),
        ..test_grant()
    };
    let (source_type, source_id) = (colliding.source_type.clone(), colliding.source_id.clone());
    storer.create_grant(colliding).await.unwrap_err();
    assert_not_found(storer.get_grant_by_source(&source_type, &source_id).await);

    let fresh = Grant {
        source_type,
        source_id,
        ..test_grant()
    };
    storer
        .create_grant(fresh)
        .await
        .expect("source should still be free");
}

async fn terminal_grants_cannot_be_created(storer: Arc<dyn Storer>) {
    let used = Grant {
        used: true,
        used_at: Some(now()),
        use_ip: "198.51.100.4".to_string(),
        ..test_grant()
    };
    let err = storer.create_grant(used.clone()).await.unwrap_err();
    assert!(matches!(err, GrantError::Invalid(_)), "got {:?}", err);
    assert_not_found(storer.get_grant(&used.id).await);

    let revoked = Grant {
        revoked: true,
        ..test_grant()
    };
    let err = storer.create_grant(revoked.clone()).await.unwrap_err();
    assert!(matches!(err, GrantError::Invalid(_)), "got {:?}", err);
    assert_not_found(
        storer
            .get_grant_by_source(&revoked.source_type, &revoked.source_id)
            .await,
    );

    // the rejected grant's ID and source stay free for an Active grant
    let active = Grant {
        used: false,
        revoked: false,
        ..revoked
    };
    storer.create_grant(active.clone()).await.unwrap();
    assert!(storer.get_grant(&active.id).await.unwrap().is_active());
}

async fn source_lookup_is_exact(storer: Arc<dyn Storer>) {
    let lower = Grant {
        source_type: "manual".to_string(),
        source_id: "abc".to_string(),
        ..test_grant()
    };
    let upper = Grant {
        source_type: "manual".to_string(),
        source_id: "ABC".to_string(),
        ..test_grant()
    };
    let other_type = Grant {
        source_type: "federated".to_string(),
        source_id: "abc".to_string(),
        ..test_grant()
    };
    for grant in [&lower, &upper, &other_type] {
        storer.create_grant(grant.clone()).await.unwrap();
    }

    let found = storer.get_grant_by_source("manual", "ABC").await.unwrap();
    assert_eq!(found.id, upper.id);
    let found = storer.get_grant_by_source("federated", "abc").await.unwrap();
    assert_eq!(found.id, other_type.id);
    assert_not_found(storer.get_grant_by_source("manual", "abcd").await);
}

async fn get_missing_grant(storer: Arc<dyn Storer>) {
    assert_not_found(storer.get_grant("does-not-exist").await);
    assert_not_found(storer.get_grant_by_source("manual", "does-not-exist").await);
}

async fn exchange_succeeds_once(storer: Arc<dyn Storer>) {
    let grant = test_grant();
    storer.create_grant(grant.clone()).await.unwrap();

    let attempt = grant_use(&grant.id, "198.51.100.4");
    let exchanged = storer
        .exchange_grant(attempt.clone())
        .await
        .expect("Failed to exchange grant");

    assert!(exchanged.used);
    assert!(!exchanged.revoked);
    assert_eq!(exchanged.use_ip, "198.51.100.4");
    assert_eq!(exchanged.used_at, Some(attempt.time));
    assert_eq!(exchanged.ancestor_ids, grant.ancestor_ids);
    assert_eq!(exchanged.created_at, grant.created_at);

    // persisted, not just returned
    assert_eq!(storer.get_grant(&grant.id).await.unwrap(), exchanged);

    let err = storer
        .exchange_grant(grant_use(&grant.id, "192.0.2.1"))
        .await
        .unwrap_err();
    assert!(matches!(err, GrantError::AlreadyUsed), "got {:?}", err);

    // the losing attempt recorded nothing
    let stored = storer.get_grant(&grant.id).await.unwrap();
    assert_eq!(stored.use_ip, "198.51.100.4");
}

async fn exchange_missing_grant(storer: Arc<dyn Storer>) {
    assert_not_found(
        storer
            .exchange_grant(grant_use("does-not-exist", "198.51.100.4"))
            .await,
    );
}

async fn revoke_succeeds_once(storer: Arc<dyn Storer>) {
    let grant = test_grant();
    storer.create_grant(grant.clone()).await.unwrap();

    let revoked = storer
        .revoke_grant(&grant.id)
        .await
        .expect("Failed to revoke grant");
    assert!(revoked.revoked);
    assert!(!revoked.used);
    assert_eq!(storer.get_grant(&grant.id).await.unwrap(), revoked);

    let err = storer
        .exchange_grant(grant_use(&grant.id, "198.51.100.4"))
        .await
        .unwrap_err();
    assert!(matches!(err, GrantError::Revoked), "got {:?}", err);

    let err = storer.revoke_grant(&grant.id).await.unwrap_err();
    assert!(matches!(err, GrantError::Revoked), "got {:?}", err);
}

async fn revoke_missing_grant(storer: Arc<dyn Storer>) {
    assert_not_found(storer.revoke_grant("does-not-exist").await);
}

async fn used_grant_cannot_be_revoked(storer: Arc<dyn Storer>) {
    let grant = test_grant();
    storer.create_grant(grant.clone()).await.unwrap();
    storer
        .exchange_grant(grant_use(&grant.id, "198.51.100.4"))
        .await
        .unwrap();

    let err = storer.revoke_grant(&grant.id).await.unwrap_err();
    assert!(matches!(err, GrantError::AlreadyUsed), "got {:?}", err);

    let stored = storer.get_grant(&grant.id).await.unwrap();
    assert!(stored.used);
    assert!(!stored.revoked);
}

async fn concurrent_exchanges_have_one_winner(storer: Arc<dyn Storer>) {
    let grant = test_grant();
    storer.create_grant(grant.clone()).await.unwrap();

    let attempts = (0..CONCURRENT_ATTEMPTS).map(|i| {
        let storer = storer.clone();
        let attempt = grant_use(&grant.id, &format!("10.0.0.{}", i));
        tokio::spawn(async move { storer.exchange_grant(attempt).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.expect("exchange task panicked"))
        .collect();

    let winners: Vec<&Grant> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    assert_eq!(winners.len(), 1, "results: {:?}", results);
    let already_used = results
        .iter()
        .filter(|r| matches!(r, Err(GrantError::AlreadyUsed)))
        .count();
    assert_eq!(already_used, CONCURRENT_ATTEMPTS - 1, "results: {:?}", results);

    // the stored use is the winner's
    let stored = storer.get_grant(&grant.id).await.unwrap();
    assert_eq!(&stored, winners[0]);
}

async fn concurrent_creates_claim_source_once(storer: Arc<dyn Storer>) {
    let template = test_grant();

    let attempts = (0..CONCURRENT_ATTEMPTS).map(|_| {
        let storer = storer.clone();
        let grant = Grant {
            source_type: template.source_type.clone(),
            source_id: template.source_id.clone(),
            ..test_grant()
        };
        tokio::spawn(async move { storer.create_grant(grant).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.expect("create task panicked"))
        .collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1, "results: {:?}", results);
    assert_eq!(
        results
            .iter()
            .filter(|r| matches!(r, Err(GrantError::SourceAlreadyUsed)))
            .count(),
        CONCURRENT_ATTEMPTS - 1,
        "results: {:?}",
        results
    );
}

async fn exchange_races_revoke(storer: Arc<dyn Storer>) {
    let grant = test_grant();
    storer.create_grant(grant.clone()).await.unwrap();

    let exchange = {
        let storer = storer.clone();
        let attempt = grant_use(&grant.id, "198.51.100.4");
        tokio::spawn(async move { storer.exchange_grant(attempt).await })
    };
    let revoke = {
        let storer = storer.clone();
        let id = grant.id.clone();
        tokio::spawn(async move { storer.revoke_grant(&id).await })
    };
    let exchanged = exchange.await.expect("exchange task panicked");
    let revoked = revoke.await.expect("revoke task panicked");

    let stored = storer.get_grant(&grant.id).await.unwrap();
    match (exchanged, revoked) {
        (Ok(_), Err(GrantError::AlreadyUsed)) => assert!(stored.used && !stored.revoked),
        (Err(GrantError::Revoked), Ok(_)) => assert!(stored.revoked && !stored.used),
        other => panic!("expected exactly one winner, got {:?}", other),
    }
}

async fn manual_grant_scenario(storer: Arc<dyn Storer>) {
    // IDs are per storer, so the literal ID is safe on shared servers.
    let grant = Grant {
        id: "g1".to_string(),
        source_type: "manual".to_string(),
        source_id: "s1".to_string(),
        scopes: vec!["read".to_string()],
        client_id: "c1".to_string(),
        created_at: now(),
        ..Default::default()
    };
    storer.create_grant(grant.clone()).await.unwrap();

    let attempt = GrantUse {
        grant: "g1".to_string(),
        ip: "8.8.8.8".to_string(),
        time: now(),
    };
    let exchanged = storer.exchange_grant(attempt.clone()).await.unwrap();
    assert_eq!(
        exchanged,
        Grant {
            used: true,
            use_ip: "8.8.8.8".to_string(),
            used_at: Some(attempt.time),
            ..grant
        }
    );

    let err = storer.exchange_grant(attempt).await.unwrap_err();
    assert!(matches!(err, GrantError::AlreadyUsed), "got {:?}", err);

    let err = storer.revoke_grant("g1").await.unwrap_err();
    assert!(matches!(err, GrantError::AlreadyUsed), "got {:?}", err);
}
