//! Single-shot repository operations against the in-process store.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::float_cmp)]

use std::time::Duration;

use kvrepo_core::{RepoConfig, RepoError, Repository};
use kvrepo_store::{Endpoint, MemoryStore, StoreError};
use kvrepo_types::{CodecError, ScoreRange, SortOrder, When};

async fn repository(store: &MemoryStore, namespace: &str) -> Repository {
    let config = RepoConfig {
        url: "memory://".to_owned(),
        namespace: namespace.to_owned(),
        ..RepoConfig::default()
    };
    Repository::connect_to(&Endpoint::Memory(store.clone()), &config)
        .await
        .expect("memory repository")
}

// =============================================================================
// Values
// =============================================================================

#[tokio::test]
async fn missing_null_and_wrong_type_are_distinct() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    assert_eq!(repo.try_get::<Option<i64>>("absent").await.unwrap(), None);

    repo.set("nothing", &None::<i64>, None).await.unwrap();
    assert_eq!(repo.try_get::<Option<i64>>("nothing").await.unwrap(), Some(None));

    repo.set("word", &"hello".to_owned(), None).await.unwrap();
    let err = repo.try_get::<i64>("word").await.unwrap_err();
    assert!(matches!(err, RepoError::Decode(CodecError::Parse { .. })));
}

#[tokio::test]
async fn scalars_round_trip_through_the_store() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    repo.set("s", &"text".to_owned(), None).await.unwrap();
    repo.set("i", &-7_i32, None).await.unwrap();
    repo.set("l", &i64::MAX, None).await.unwrap();
    repo.set("d", &2.5_f64, None).await.unwrap();
    repo.set("b", &true, None).await.unwrap();
    repo.set("nb", &Some(false), None).await.unwrap();

    assert_eq!(repo.try_get::<String>("s").await.unwrap().as_deref(), Some("text"));
    assert_eq!(repo.try_get::<i32>("i").await.unwrap(), Some(-7));
    assert_eq!(repo.try_get::<i64>("l").await.unwrap(), Some(i64::MAX));
    assert_eq!(repo.try_get::<f64>("d").await.unwrap(), Some(2.5));
    assert_eq!(repo.try_get::<bool>("b").await.unwrap(), Some(true));
    assert_eq!(repo.try_get::<Option<bool>>("nb").await.unwrap(), Some(Some(false)));
    // Booleans are stored as -1 / 0.
    assert_eq!(repo.try_get::<String>("b").await.unwrap().as_deref(), Some("-1"));
}

#[tokio::test]
async fn conditional_set_and_delete() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    assert!(!repo.set_when("k", &1_i64, None, When::Exists).await.unwrap());
    assert!(repo.set_when("k", &1_i64, None, When::NotExists).await.unwrap());
    assert!(!repo.set_when("k", &2_i64, None, When::NotExists).await.unwrap());
    assert_eq!(repo.try_get::<i64>("k").await.unwrap(), Some(1));

    assert!(repo.delete("k").await.unwrap());
    assert!(!repo.delete("k").await.unwrap());

    repo.set("a", &1_i64, None).await.unwrap();
    repo.set("b", &1_i64, None).await.unwrap();
    assert_eq!(repo.delete_many(&["a", "b", "c"]).await.unwrap(), 2);
}

#[tokio::test]
async fn counters_append_and_exchange() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    assert_eq!(repo.increment("n", 5).await.unwrap(), 5);
    assert_eq!(repo.decrement("n", 2).await.unwrap(), 3);
    assert_eq!(repo.increment_float("f", 1.5).await.unwrap(), 1.5);
    assert_eq!(repo.decrement_float("f", 0.25).await.unwrap(), 1.25);

    assert_eq!(repo.set_or_append("log", "ab").await.unwrap(), 2);
    assert_eq!(repo.set_or_append("log", "cd").await.unwrap(), 4);
    assert_eq!(repo.try_get::<String>("log").await.unwrap().as_deref(), Some("abcd"));

    assert_eq!(repo.atomic_exchange("x", &10_i64).await.unwrap(), None);
    assert_eq!(repo.atomic_exchange("x", &20_i64).await.unwrap(), Some(10));
    assert_eq!(repo.try_get::<i64>("x").await.unwrap(), Some(20));
}

#[tokio::test]
async fn namespaces_are_isolated_and_stripped() {
    let store = MemoryStore::new();
    let orders = repository(&store, "orders").await;
    let users = repository(&store, "users").await;

    orders.set("1", &"a".to_owned(), None).await.unwrap();
    orders.set("2", &"b".to_owned(), None).await.unwrap();
    users.set("1", &"c".to_owned(), None).await.unwrap();

    let mut keys = orders.get_keys(None).await.unwrap();
    keys.sort();
    assert_eq!(keys, ["1", "2"]);
    assert_eq!(users.get_keys(Some("1")).await.unwrap(), ["1"]);
    assert_eq!(users.try_get::<String>("2").await.unwrap(), None);
}

// =============================================================================
// Expiry and locks
// =============================================================================

#[tokio::test(start_paused = true)]
async fn time_to_live_only_touches_existing_keys() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    assert!(!repo.set_time_to_live("missing", Some(Duration::from_secs(5))).await.unwrap());
    assert_eq!(repo.try_get::<String>("missing").await.unwrap(), None);

    repo.set("k", &"v".to_owned(), None).await.unwrap();
    assert_eq!(repo.get_time_to_live("k").await.unwrap(), None);
    // Nothing to clear.
    assert!(!repo.set_time_to_live("k", None).await.unwrap());

    assert!(repo.set_time_to_live("k", Some(Duration::from_secs(10))).await.unwrap());
    let ttl = repo.get_time_to_live("k").await.unwrap().unwrap();
    assert!(ttl > Duration::from_secs(9) && ttl <= Duration::from_secs(10));

    assert!(repo.set_time_to_live("k", None).await.unwrap());
    assert_eq!(repo.get_time_to_live("k").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn expired_values_disappear() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    repo.set("k", &1_i64, Some(Duration::from_millis(200))).await.unwrap();
    assert_eq!(repo.try_get::<i64>("k").await.unwrap(), Some(1));
    tokio::time::advance(Duration::from_millis(250)).await;
    assert_eq!(repo.try_get::<i64>("k").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn distributed_lock_is_reentrant_for_its_holder() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;
    let ttl = Duration::from_secs(1);

    assert!(repo.try_get_distributed_lock("job", "worker-a", ttl).await.unwrap());
    assert!(repo.try_get_distributed_lock("job", "worker-a", ttl).await.unwrap());
    assert!(!repo.try_get_distributed_lock("job", "worker-b", ttl).await.unwrap());

    tokio::time::advance(Duration::from_millis(1100)).await;
    assert!(repo.try_get_distributed_lock("job", "worker-b", ttl).await.unwrap());
}

// =============================================================================
// Collections
// =============================================================================

#[tokio::test]
async fn lists() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    assert_eq!(repo.add_to_list("l", "a").await.unwrap(), 1);
    assert_eq!(repo.add_range_to_list("l", &["b", "c", "d"]).await.unwrap(), 4);
    assert_eq!(repo.get_list("l", 0, -1).await.unwrap(), ["a", "b", "c", "d"]);
    assert_eq!(repo.get_list("l", 1, 2).await.unwrap(), ["b", "c"]);
    assert!(repo.get_list("none", 0, -1).await.unwrap().is_empty());
}

#[tokio::test]
async fn sets() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    assert!(repo.set_add("a", &1_i64).await.unwrap());
    assert!(!repo.set_add("a", &1_i64).await.unwrap());
    assert_eq!(repo.set_add_many("a", &[2_i64, 3]).await.unwrap(), 2);
    assert_eq!(repo.set_add_many("b", &[3_i64, 4]).await.unwrap(), 2);
    assert_eq!(repo.set_length("a").await.unwrap(), 3);
    assert!(repo.set_contains("a", &2_i64).await.unwrap());

    let mut members = repo.set_members::<i64>("a").await.unwrap();
    members.sort_unstable();
    assert_eq!(members, [1, 2, 3]);

    assert_eq!(repo.intersect_sets(&["a", "b"]).await.unwrap(), ["3"]);
    assert_eq!(repo.sets_difference(&["a", "b"]).await.unwrap(), ["1", "2"]);
    assert_eq!(repo.union_sets(&["a", "b"]).await.unwrap().len(), 4);
    assert_eq!(repo.union_sets_and_store("all", &["a", "b"]).await.unwrap(), 4);
    assert_eq!(repo.intersect_sets_and_store("both", &["a", "b"]).await.unwrap(), 1);
    assert_eq!(repo.sets_difference_and_store("only_a", &["a", "b"]).await.unwrap(), 2);

    assert!(repo.set_remove("a", &1_i64).await.unwrap());
    assert_eq!(repo.set_remove_many("a", &[2_i64, 9]).await.unwrap(), 1);
    assert_eq!(repo.set_length("a").await.unwrap(), 1);
}

#[tokio::test]
async fn conditional_sorted_set_adds() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;
    let ann = "ann".to_owned();
    let scored = |score: f64| {
        repo.sorted_set_range_by_score::<String>(
            "z",
            ScoreRange::new(score, score),
            SortOrder::Ascending,
            0,
            -1,
        )
    };

    // XX never creates a member.
    assert!(!repo.sorted_set_add("z", &ann, 1.0, When::Exists).await.unwrap());
    assert_eq!(repo.sorted_set_rank("z", &ann, SortOrder::Ascending).await.unwrap(), None);

    assert!(repo.sorted_set_add("z", &ann, 1.0, When::NotExists).await.unwrap());
    // NX leaves an existing score alone; XX updates it.
    assert!(!repo.sorted_set_add("z", &ann, 9.0, When::NotExists).await.unwrap());
    assert_eq!(scored(1.0).await.unwrap(), ["ann"]);
    assert!(!repo.sorted_set_add("z", &ann, 4.0, When::Exists).await.unwrap());
    assert_eq!(scored(4.0).await.unwrap(), ["ann"]);

    let added = repo
        .sorted_set_add_many(
            "z",
            &[(ann.clone(), 0.0), ("bob".to_owned(), 2.0)],
            When::NotExists,
        )
        .await
        .unwrap();
    assert_eq!(added, 1);
    assert_eq!(scored(4.0).await.unwrap(), ["ann"]);
    assert!(scored(0.0).await.unwrap().is_empty());
}

#[tokio::test]
async fn sorted_sets() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    assert!(repo.sorted_set_add("z", &"a".to_owned(), 1.0, When::Always).await.unwrap());
    let added = repo
        .sorted_set_add_many(
            "z",
            &[("b".to_owned(), 2.0), ("c".to_owned(), 3.0)],
            When::Always,
        )
        .await
        .unwrap();
    assert_eq!(added, 2);

    let top: Vec<String> = repo
        .sorted_set_range_by_rank("z", 0, 1, SortOrder::Descending)
        .await
        .unwrap();
    assert_eq!(top, ["c", "b"]);

    let window: Vec<String> = repo
        .sorted_set_range_by_score("z", ScoreRange::new(1.5, 3.0), SortOrder::Ascending, 0, -1)
        .await
        .unwrap();
    assert_eq!(window, ["b", "c"]);
    let paged: Vec<String> = repo
        .sorted_set_range_by_score("z", ScoreRange::all(), SortOrder::Ascending, 1, 1)
        .await
        .unwrap();
    assert_eq!(paged, ["b"]);

    assert_eq!(
        repo.sorted_set_rank("z", &"a".to_owned(), SortOrder::Descending).await.unwrap(),
        Some(2)
    );
    assert_eq!(
        repo.sorted_set_rank("z", &"q".to_owned(), SortOrder::Ascending).await.unwrap(),
        None
    );

    assert_eq!(repo.sorted_set_remove_range_by_score("z", ScoreRange::new(3.0, 3.0)).await.unwrap(), 1);
    assert_eq!(repo.sorted_set_remove_range_by_rank("z", 0, 0).await.unwrap(), 1);
    let rest: Vec<String> = repo
        .sorted_set_range_by_rank("z", 0, -1, SortOrder::Ascending)
        .await
        .unwrap();
    assert_eq!(rest, ["b"]);
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test(start_paused = true)]
async fn reads_retry_transient_failures() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;
    repo.set("k", &1_i64, None).await.unwrap();

    store.fail_next("GET", 2, StoreError::Timeout);
    assert_eq!(repo.try_get::<i64>("k").await.unwrap(), Some(1));
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_return_the_original_error() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    // Five failures exhaust the default budget of five attempts...
    store.fail_next("GET", 5, StoreError::Io("connection reset".to_owned()));
    let err = repo.try_get::<i64>("k").await.unwrap_err();
    assert_eq!(err, RepoError::Store(StoreError::Io("connection reset".to_owned())));

    // ...and four leave the fifth attempt to succeed.
    store.fail_next("GET", 4, StoreError::Io("connection reset".to_owned()));
    assert_eq!(repo.try_get::<i64>("k").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn increments_are_attempted_once() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    store.fail_next("INCRBY", 1, StoreError::Timeout);
    assert_eq!(
        repo.increment("n", 1).await.unwrap_err(),
        RepoError::Store(StoreError::Timeout)
    );
    // The single failure was consumed by the single attempt.
    assert_eq!(repo.increment("n", 1).await.unwrap(), 1);
}

#[tokio::test]
async fn fatal_store_errors_are_not_retried() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    store.fail_next("SET", 2, StoreError::ResourceExhausted("OOM".to_owned()));
    assert!(repo.set("k", &1_i64, None).await.is_err());
    // One failure left, so the next call fails too.
    assert!(repo.set("k", &1_i64, None).await.is_err());
    assert!(repo.set("k", &1_i64, None).await.is_ok());
}

#[tokio::test]
async fn closed_repository_rejects_calls() {
    let store = MemoryStore::new();
    let repo = repository(&store, "t").await;

    repo.close().await.unwrap();
    assert_eq!(repo.try_get::<i64>("k").await.unwrap_err(), RepoError::PoolShutDown);
    assert!(matches!(
        repo.begin_transaction(),
        Err(RepoError::PoolShutDown)
    ));
}

#[tokio::test]
async fn empty_pool_is_a_configuration_error() {
    let config = RepoConfig {
        total_connections: 0,
        ..RepoConfig::default()
    };
    let result = Repository::connect_to(&Endpoint::Memory(MemoryStore::new()), &config).await;
    assert!(matches!(result, Err(RepoError::Config(_))));
}
