//! Tests against a live Redis-compatible server.
//!
//! Ignored by default. Start a server (`docker compose up -d`) and run with
//! `cargo test -p kvrepo-core --test live_redis -- --ignored`. Set
//! `KVREPO_URL` to point somewhere other than `redis://localhost:6379`.
//! Every test works in its own random namespace.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use kvrepo_core::{RepoConfig, RepoError, Repository};
use kvrepo_types::{CodecError, SortOrder, When};
use uuid::Uuid;

async fn live_repository() -> Repository {
    let mut config = RepoConfig {
        namespace: format!("kvrepo-test-{}", Uuid::new_v4()),
        ..RepoConfig::default()
    };
    config.apply_env_overrides();
    Repository::connect(&config)
        .await
        .expect("live server reachable")
}

#[tokio::test]
#[ignore = "requires live Redis-compatible instance (docker compose up -d)"]
async fn live_values_and_counters() {
    let repo = live_repository().await;

    assert_eq!(repo.try_get::<String>("absent").await.unwrap(), None);
    repo.set("name", &"kvrepo".to_owned(), None).await.unwrap();
    assert_eq!(repo.try_get::<String>("name").await.unwrap().as_deref(), Some("kvrepo"));
    assert_eq!(repo.increment("count", 3).await.unwrap(), 3);
    assert_eq!(repo.decrement("count", 1).await.unwrap(), 2);

    let mut keys = repo.get_keys(None).await.unwrap();
    keys.sort();
    assert_eq!(keys, ["count", "name"]);

    assert_eq!(repo.delete_many(&["count", "name"]).await.unwrap(), 2);
    repo.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires live Redis-compatible instance (docker compose up -d)"]
async fn live_expiry() {
    let repo = live_repository().await;

    repo.set("session", &1_i64, None).await.unwrap();
    assert!(
        repo.set_time_to_live("session", Some(Duration::from_secs(30)))
            .await
            .unwrap()
    );
    let ttl = repo.get_time_to_live("session").await.unwrap().unwrap();
    assert!(ttl <= Duration::from_secs(30));
    assert!(repo.set_time_to_live("session", None).await.unwrap());
    assert_eq!(repo.get_time_to_live("session").await.unwrap(), None);

    repo.delete("session").await.unwrap();
    repo.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires live Redis-compatible instance (docker compose up -d)"]
async fn live_transaction_and_watch() {
    let repo = live_repository().await;

    let mut batch = repo.begin_transaction().unwrap();
    batch.sorted_set_add("board", &"ann".to_owned(), 2.0, When::Always).unwrap();
    batch.sorted_set_add("board", &"bob".to_owned(), 1.0, When::Always).unwrap();
    let ranked = batch
        .sorted_set_range_by_rank::<String>("board", 0, -1, SortOrder::Descending)
        .unwrap();
    batch.execute().await.unwrap();
    assert_eq!(ranked.into_value().unwrap(), ["ann", "bob"]);

    repo.set("balance", &10_i64, None).await.unwrap();
    let mut batch = repo.begin_transaction().unwrap();
    batch.watch("balance").await.unwrap();
    batch.decrement("balance", 1).unwrap();
    repo.set("balance", &0_i64, None).await.unwrap();
    assert_eq!(batch.execute().await.unwrap_err(), RepoError::CommitFailed);
    assert_eq!(repo.try_get::<i64>("balance").await.unwrap(), Some(0));

    repo.delete_many(&["board", "balance"]).await.unwrap();
    repo.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires live Redis-compatible instance (docker compose up -d)"]
async fn live_exec_errors_stay_with_their_operation() {
    let repo = live_repository().await;
    repo.add_to_list("jobs", "a").await.unwrap();

    let mut batch = repo.begin_transaction().unwrap();
    let counted = batch.increment("counter", 5).unwrap();
    let wrong = batch.increment("jobs", 1).unwrap();
    batch.execute().await.unwrap();

    assert_eq!(counted.into_value().unwrap(), 5);
    assert!(matches!(
        wrong.into_value(),
        Err(RepoError::Decode(CodecError::ErrorReply(message))) if message.starts_with("WRONGTYPE")
    ));
    // Committed once, not resubmitted.
    assert_eq!(repo.try_get::<i64>("counter").await.unwrap(), Some(5));

    repo.delete_many(&["jobs", "counter"]).await.unwrap();
    repo.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires live Redis-compatible instance (docker compose up -d)"]
async fn live_script_survives_flush() {
    const ADD: &str = "return redis.call('INCRBY', @Key1, @LongArg1)";
    let repo = live_repository().await;

    let mut args = repo.create_script_args();
    args.set_key(1, "hits").unwrap().set_long(1, 2).unwrap();
    assert_eq!(repo.run_script_as::<i64>(ADD, &args).await.unwrap(), Some(2));

    let handle = repo.scripts().cached(ADD).await.unwrap();
    let slot = repo.pool().acquire().unwrap();
    slot.connection()
        .execute(&kvrepo_store::Command::ScriptFlush)
        .await
        .unwrap();

    assert_eq!(repo.run_script_as::<i64>(ADD, &args).await.unwrap(), Some(4));
    assert_eq!(repo.scripts().cached(ADD).await.unwrap().sha(), handle.sha());

    repo.delete("hits").await.unwrap();
    repo.close().await.unwrap();
}

#[tokio::test]
#[ignore = "requires live Redis-compatible instance (docker compose up -d)"]
async fn live_distributed_lock() {
    let repo = live_repository().await;
    let ttl = Duration::from_secs(10);

    assert!(repo.try_get_distributed_lock("lock", "worker-a", ttl).await.unwrap());
    assert!(repo.try_get_distributed_lock("lock", "worker-a", ttl).await.unwrap());
    assert!(!repo.try_get_distributed_lock("lock", "worker-b", ttl).await.unwrap());

    repo.delete("lock").await.unwrap();
    repo.close().await.unwrap();
}
