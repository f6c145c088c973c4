//! End-to-end engine scenarios against scripted connections.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::*;
use rudder_engine::{
    Command, CommandControl, CommandError, ConnectionFactory, DiscoveryMode, Endpoint,
    EngineConfig, EngineState, Hint, RoleRequirement, RoutingEngine, ShardId, WaitMode,
};
use tokio::time::{timeout, Instant};

fn ep(host: &str) -> Endpoint {
    Endpoint::new(host, 6379)
}

fn cluster_config(seeds: Vec<Endpoint>) -> EngineConfig {
    EngineConfig {
        mode: DiscoveryMode::Cluster,
        seeds,
        check_interval: Duration::from_millis(200),
        ..EngineConfig::default()
    }
}

fn start_engine(cfg: EngineConfig, factory: Arc<MockFactory>) -> RoutingEngine {
    // RUDDER_LOG=debug cargo test -p rudder-engine shows the loop's view
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RUDDER_LOG")
                .unwrap_or_else(|_| "off".into()),
        )
        .try_init();

    let engine = RoutingEngine::new(cfg, factory as Arc<dyn ConnectionFactory>);
    engine.init().expect("init");
    engine.start().expect("start");
    engine
}

/// Two primaries, no replicas: slots 0-8191 on 10.0.0.1, the rest on
/// 10.0.0.2. GET answers with `<key>@<host>`.
fn two_shard_script() -> Script {
    Arc::new(|endpoint, words| match words[0].as_str() {
        "CLUSTER" => MockReply::Now(Ok(cluster_slots(&[
            (0, 8191, "10.0.0.1", &[]),
            (8192, 16383, "10.0.0.2", &[]),
        ]))),
        "GET" => ok_bulk(&format!("{}@{}", words[1], endpoint.host)),
        _ => server_error("ERR unknown command"),
    })
}

#[tokio::test]
async fn discovers_topology_and_routes_by_key() {
    let factory = MockFactory::new(true, two_shard_script());
    let engine = start_engine(
        cluster_config(vec![ep("10.0.0.1"), ep("10.0.0.2")]),
        Arc::clone(&factory),
    );

    assert!(
        engine
            .wait_connected_once(WaitMode::PrimaryOnly, Instant::now() + Duration::from_secs(2))
            .await
    );
    eventually(|| engine.shard_by_key(b"foo").is_some(), "slot map learned").await;

    // "foo" hashes to slot 12182, second shard
    assert_eq!(engine.shard_by_key(b"foo"), Some(ShardId(1)));
    assert_eq!(engine.shards_count(), 2);

    // sample keys regenerate alongside the slot map
    eventually(
        || engine.any_key_for_shard(ShardId(0)).is_some(),
        "sample keys generated",
    )
    .await;
    let sample = engine.any_key_for_shard(ShardId(0)).unwrap();
    assert_eq!(engine.shard_by_key(sample.as_bytes()), Some(ShardId(0)));

    let outcome = timeout(
        Duration::from_secs(2),
        engine.submit(
            Command::new(["GET", "foo"]),
            Hint::by_key("foo", RoleRequirement::Any),
        ),
    )
    .await
    .expect("reply in time")
    .expect("engine delivered");
    assert_eq!(outcome, Ok(bulk("foo@10.0.0.2")));

    let served_by = factory.conn_for("10.0.0.2", 6379).unwrap();
    assert!(served_by
        .sent_commands()
        .iter()
        .any(|c| c == "GET foo"));

    engine.stop().await;
}

#[tokio::test]
async fn hash_tagged_keys_route_to_the_same_shard() {
    let script: Script = Arc::new(|endpoint, words| match words[0].as_str() {
        "CLUSTER" => MockReply::Now(Ok(cluster_slots(&[
            (0, 5460, "10.0.0.1", &[]),
            (5461, 10922, "10.0.0.2", &[]),
            (10923, 16383, "10.0.0.3", &[]),
        ]))),
        "GET" => ok_bulk(&endpoint.host.clone()),
        _ => server_error("ERR unknown command"),
    });
    let factory = MockFactory::new(true, script);
    let engine = start_engine(
        cluster_config(vec![ep("10.0.0.1"), ep("10.0.0.2"), ep("10.0.0.3")]),
        factory,
    );

    eventually(
        || engine.shard_by_key(b"{user1000}.followers").is_some(),
        "slot map learned",
    )
    .await;

    // "user1000" hashes to slot 5474, second shard; the tag pins both
    let followers = engine.shard_by_key(b"{user1000}.followers");
    let profile = engine.shard_by_key(b"{user1000}.profile");
    assert_eq!(followers, Some(ShardId(1)));
    assert_eq!(followers, profile);
    assert_eq!(followers, engine.shard_by_key(b"user1000"));

    engine.stop().await;
}

#[tokio::test]
async fn moved_redirect_reroutes_and_updates_the_slot_map() {
    let slots_calls = Arc::new(AtomicUsize::new(0));
    let script: Script = {
        let slots_calls = Arc::clone(&slots_calls);
        Arc::new(move |endpoint, words| match words[0].as_str() {
            "CLUSTER" => {
                // the first answer still claims slot 12182; refreshes
                // triggered by the MOVED report the new layout
                let stale = slots_calls.fetch_add(1, Ordering::SeqCst) == 0;
                let boundary = if stale { 12999 } else { 11999 };
                MockReply::Now(Ok(cluster_slots(&[
                    (0, boundary, "10.0.0.1", &[]),
                    (boundary + 1, 16383, "10.0.0.7", &[]),
                ])))
            }
            "GET" if endpoint.host == "10.0.0.1" => {
                server_error("MOVED 12182 10.0.0.7:6379")
            }
            "GET" => ok_bulk("relocated"),
            _ => server_error("ERR unknown command"),
        })
    };
    let factory = MockFactory::new(true, script);
    // a long poll interval pins the stale layout until the MOVED lands
    let cfg = EngineConfig {
        check_interval: Duration::from_secs(30),
        ..cluster_config(vec![ep("10.0.0.1"), ep("10.0.0.7")])
    };
    let engine = start_engine(cfg, Arc::clone(&factory));

    eventually(|| engine.shard_by_key(b"foo").is_some(), "slot map learned").await;
    assert_eq!(engine.shard_by_key(b"foo"), Some(ShardId(0)));

    let outcome = timeout(
        Duration::from_secs(2),
        engine.submit(
            Command::new(["GET", "foo"]),
            Hint::by_key("foo", RoleRequirement::MustPrimary),
        ),
    )
    .await
    .expect("reply in time")
    .expect("engine delivered");
    assert_eq!(outcome, Ok(bulk("relocated")));

    // the redirect re-learned slot ownership
    eventually(
        || engine.shard_by_key(b"foo") == Some(ShardId(1)),
        "slot 12182 remapped",
    )
    .await;
    assert!(engine.statistics().engine.redirects_moved >= 1);

    engine.stop().await;
}

#[tokio::test]
async fn commands_queue_until_the_shard_is_ready() {
    let script: Script = Arc::new(|_, words| match words[0].as_str() {
        "CLUSTER" => MockReply::Now(Ok(cluster_slots(&[(0, 16383, "10.0.0.1", &[])]))),
        "GET" => ok_bulk("v"),
        _ => server_error("ERR unknown command"),
    });
    let factory = MockFactory::new(false, script);
    let engine = start_engine(cluster_config(vec![ep("10.0.0.1")]), Arc::clone(&factory));

    let rx = engine.submit(
        Command::new(["GET", "k"]),
        Hint::by_shard(ShardId(0), RoleRequirement::Any),
    );

    // nothing is ready: the command must not reach the wire
    tokio::time::sleep(Duration::from_millis(300)).await;
    let conn = factory.conn_for("10.0.0.1", 6379).unwrap();
    assert!(conn.sent_commands().is_empty());

    conn.go_ready();

    let outcome = timeout(Duration::from_secs(2), rx)
        .await
        .expect("reply in time")
        .expect("engine delivered");
    assert_eq!(outcome, Ok(bulk("v")));

    // dispatched exactly once
    let gets = conn
        .sent_commands()
        .iter()
        .filter(|c| *c == "GET k")
        .count();
    assert_eq!(gets, 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn wait_connected_times_out_at_the_deadline() {
    let script: Script = Arc::new(|_, _| server_error("ERR unused"));
    let factory = MockFactory::new(false, script);
    let engine = start_engine(cluster_config(vec![ep("10.0.0.1")]), factory);

    let start = Instant::now();
    let ready = engine
        .wait_connected_once(WaitMode::PrimaryOnly, start + Duration::from_millis(50))
        .await;
    assert!(!ready);
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(50), "returned early: {waited:?}");
    assert!(waited < Duration::from_millis(500), "overslept: {waited:?}");

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn queued_commands_time_out_at_their_deadline() {
    let script: Script = Arc::new(|_, _| server_error("ERR unused"));
    let factory = MockFactory::new(false, script);
    let engine = start_engine(cluster_config(vec![ep("10.0.0.1")]), factory);

    let control = CommandControl {
        deadline: Some(Instant::now() + Duration::from_millis(100)),
        ..CommandControl::default()
    };
    let rx = engine.submit(
        Command::new(["GET", "k"]).with_control(control),
        Hint::by_shard(ShardId(0), RoleRequirement::Any),
    );

    let outcome = timeout(Duration::from_secs(5), rx)
        .await
        .expect("reply in time")
        .expect("engine delivered");
    assert_eq!(outcome, Err(CommandError::NoReadyConnection));
    assert!(engine.statistics().engine.completed_err >= 1);

    engine.stop().await;
}

#[tokio::test(start_paused = true)]
async fn commands_without_budgets_inherit_the_engine_default() {
    let script: Script = Arc::new(|_, _| server_error("ERR unused"));
    let factory = MockFactory::new(false, script);
    let cfg = EngineConfig {
        default_control: CommandControl {
            deadline: Some(Instant::now() + Duration::from_millis(100)),
            ..CommandControl::default()
        },
        ..cluster_config(vec![ep("10.0.0.1")])
    };
    let engine = start_engine(cfg, factory);

    // no per-command control: the engine's default deadline applies
    let rx = engine.submit(
        Command::new(["GET", "k"]),
        Hint::by_shard(ShardId(0), RoleRequirement::Any),
    );

    let outcome = timeout(Duration::from_secs(5), rx)
        .await
        .expect("reply in time")
        .expect("engine delivered");
    assert_eq!(outcome, Err(CommandError::NoReadyConnection));

    engine.stop().await;
}

#[tokio::test]
async fn stop_fails_new_submissions_but_delivers_in_flight_replies() {
    let script: Script = Arc::new(|_, words| match words[0].as_str() {
        "CLUSTER" => MockReply::Now(Ok(cluster_slots(&[(0, 16383, "10.0.0.1", &[])]))),
        "GET" if words[1] == "slow" => MockReply::Park,
        "GET" => ok_bulk("v"),
        _ => server_error("ERR unknown command"),
    });
    let factory = MockFactory::new(true, script);
    let engine = start_engine(cluster_config(vec![ep("10.0.0.1")]), Arc::clone(&factory));

    assert!(
        engine
            .wait_connected_once(WaitMode::PrimaryOnly, Instant::now() + Duration::from_secs(2))
            .await
    );

    let slow_rx = engine.submit(
        Command::new(["GET", "slow"]),
        Hint::by_shard(ShardId(0), RoleRequirement::Any),
    );
    let conn = factory.conn_for("10.0.0.1", 6379).unwrap();
    eventually(|| conn.parked_count() == 1, "command in flight").await;

    let stopper = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.stop().await })
    };
    eventually(|| engine.state() >= EngineState::Stopping, "stop observed").await;

    // a submission after stop() fails without touching a connection
    let sent_before = conn.sent_commands().len();
    let late = engine
        .submit(
            Command::new(["GET", "late"]),
            Hint::by_shard(ShardId(0), RoleRequirement::Any),
        )
        .await
        .expect("engine delivered");
    assert_eq!(late, Err(CommandError::ShuttingDown));
    assert_eq!(conn.sent_commands().len(), sent_before);

    // the reply already on the wire still reaches its caller
    conn.release_parked(Ok(bulk("late-but-fine")));
    let outcome = timeout(Duration::from_secs(2), slow_rx)
        .await
        .expect("reply in time")
        .expect("engine delivered");
    assert_eq!(outcome, Ok(bulk("late-but-fine")));

    stopper.await.unwrap();
    assert_eq!(engine.state(), EngineState::Stopped);
    eventually(|| conn.is_closed(), "connections closed").await;
}

#[tokio::test]
async fn sentinel_mode_tracks_primary_and_replica() {
    let script: Script = Arc::new(|endpoint, words| match words[0].as_str() {
        "SENTINEL" if words[1] == "MASTERS" => {
            MockReply::Now(Ok(sentinel_masters(&[("cache-0", "10.0.1.1", 6379)])))
        }
        "SENTINEL" => MockReply::Now(Ok(sentinel_replicas(&[("10.0.1.2", 6379)]))),
        "GET" => ok_bulk(&endpoint.host.clone()),
        _ => server_error("ERR unknown command"),
    });
    let factory = MockFactory::new(true, script);
    let cfg = EngineConfig {
        mode: DiscoveryMode::Sentinel {
            shards: vec!["cache-0".to_string()],
        },
        seeds: vec![Endpoint::new("10.0.9.1", 26379)],
        check_interval: Duration::from_millis(100),
        ..EngineConfig::default()
    };
    let engine = start_engine(cfg, Arc::clone(&factory));

    assert!(
        engine
            .wait_connected_once(
                WaitMode::PrimaryAndReplica,
                Instant::now() + Duration::from_secs(2)
            )
            .await
    );
    engine.wait_connected_debug(true).await;

    let outcome = timeout(
        Duration::from_secs(2),
        engine.submit(
            Command::new(["GET", "x"]),
            Hint::by_shard(ShardId(0), RoleRequirement::MustPrimary),
        ),
    )
    .await
    .expect("reply in time")
    .expect("engine delivered");
    assert_eq!(outcome, Ok(bulk("10.0.1.1")));

    // one sentinel link plus primary and replica
    assert_eq!(factory.connection_count(), 3);
    let stats = engine.statistics();
    assert!(stats.sentinel.is_some());
    assert_eq!(stats.shards.len(), 1);
    assert_eq!(stats.shards[0].name, "cache-0");

    engine.stop().await;
}

#[tokio::test]
async fn sentinel_failover_flips_roles_without_reconnecting() {
    let failed_over = Arc::new(AtomicBool::new(false));
    let script: Script = {
        let failed_over = Arc::clone(&failed_over);
        Arc::new(move |endpoint, words| match words[0].as_str() {
            "SENTINEL" if words[1] == "MASTERS" => {
                let primary = if failed_over.load(Ordering::SeqCst) {
                    "10.0.1.2"
                } else {
                    "10.0.1.1"
                };
                MockReply::Now(Ok(sentinel_masters(&[("cache-0", primary, 6379)])))
            }
            "SENTINEL" => {
                let replica = if failed_over.load(Ordering::SeqCst) {
                    "10.0.1.1"
                } else {
                    "10.0.1.2"
                };
                MockReply::Now(Ok(sentinel_replicas(&[(replica, 6379)])))
            }
            "GET" => ok_bulk(&endpoint.host.clone()),
            _ => server_error("ERR unknown command"),
        })
    };
    let factory = MockFactory::new(true, script);
    let cfg = EngineConfig {
        mode: DiscoveryMode::Sentinel {
            shards: vec!["cache-0".to_string()],
        },
        seeds: vec![Endpoint::new("10.0.9.1", 26379)],
        check_interval: Duration::from_millis(100),
        ..EngineConfig::default()
    };
    let engine = start_engine(cfg, Arc::clone(&factory));

    assert!(
        engine
            .wait_connected_once(
                WaitMode::PrimaryAndReplica,
                Instant::now() + Duration::from_secs(2)
            )
            .await
    );

    failed_over.store(true, Ordering::SeqCst);
    engine.force_update_hosts();

    eventually(
        || {
            let shards = engine.master_shards();
            shards.first().is_some_and(|shard| {
                shard.endpoints().iter().any(|(ep, role)| {
                    ep.host == "10.0.1.2" && *role == rudder_engine::Role::Primary
                })
            })
        },
        "promotion applied",
    )
    .await;

    // the same three connections survive the failover
    assert_eq!(factory.connection_count(), 3);

    let outcome = timeout(
        Duration::from_secs(2),
        engine.submit(
            Command::new(["GET", "y"]),
            Hint::by_shard(ShardId(0), RoleRequirement::MustPrimary),
        ),
    )
    .await
    .expect("reply in time")
    .expect("engine delivered");
    assert_eq!(outcome, Ok(bulk("10.0.1.2")));

    engine.stop().await;
}

#[tokio::test]
async fn connection_errors_retry_within_budget() {
    let failures = Arc::new(AtomicUsize::new(0));
    let script: Script = {
        let failures = Arc::clone(&failures);
        Arc::new(move |_, words| match words[0].as_str() {
            "CLUSTER" => MockReply::Now(Ok(cluster_slots(&[(0, 16383, "10.0.0.1", &[])]))),
            "GET" => {
                if failures.fetch_add(1, Ordering::SeqCst) == 0 {
                    dropped()
                } else {
                    ok_bulk("recovered")
                }
            }
            _ => server_error("ERR unknown command"),
        })
    };
    let factory = MockFactory::new(true, script);
    let engine = start_engine(cluster_config(vec![ep("10.0.0.1")]), factory);

    assert!(
        engine
            .wait_connected_once(WaitMode::PrimaryOnly, Instant::now() + Duration::from_secs(2))
            .await
    );

    let outcome = timeout(
        Duration::from_secs(2),
        engine.submit(
            Command::new(["GET", "r"]),
            Hint::by_shard(ShardId(0), RoleRequirement::Any),
        ),
    )
    .await
    .expect("reply in time")
    .expect("engine delivered");
    assert_eq!(outcome, Ok(bulk("recovered")));
    assert_eq!(engine.statistics().engine.retries, 1);

    engine.stop().await;
}

#[tokio::test]
async fn redirect_ping_pong_exhausts_the_limit() {
    let script: Script = Arc::new(|endpoint, words| match words[0].as_str() {
        "CLUSTER" => MockReply::Now(Ok(cluster_slots(&[
            (0, 8191, "10.0.0.1", &[]),
            (8192, 16383, "10.0.0.2", &[]),
        ]))),
        "GET" if endpoint.host == "10.0.0.1" => server_error("MOVED 100 10.0.0.2:6379"),
        "GET" => server_error("MOVED 100 10.0.0.1:6379"),
        _ => server_error("ERR unknown command"),
    });
    let factory = MockFactory::new(true, script);
    let engine = start_engine(cluster_config(vec![ep("10.0.0.1"), ep("10.0.0.2")]), factory);

    eventually(|| engine.shard_by_key(b"foo").is_some(), "slot map learned").await;

    let outcome = timeout(
        Duration::from_secs(2),
        engine.submit(
            Command::new(["GET", "p"]),
            Hint::by_shard(ShardId(0), RoleRequirement::MustPrimary),
        ),
    )
    .await
    .expect("reply in time")
    .expect("engine delivered");
    assert!(
        matches!(outcome, Err(CommandError::RedirectLimit(_))),
        "got {outcome:?}"
    );

    engine.stop().await;
}

#[tokio::test]
async fn ask_redirect_is_one_shot_and_leaves_the_slot_map_alone() {
    let script: Script = Arc::new(|endpoint, words| match words[0].as_str() {
        "CLUSTER" => MockReply::Now(Ok(cluster_slots(&[
            (0, 12999, "10.0.0.1", &[]),
            (13000, 16383, "10.0.0.2", &[]),
        ]))),
        "GET" if endpoint.host == "10.0.0.1" => server_error("ASK 12182 10.0.0.2:6379"),
        "GET" => ok_bulk("ask-served"),
        _ => server_error("ERR unknown command"),
    });
    let factory = MockFactory::new(true, script);
    let engine = start_engine(cluster_config(vec![ep("10.0.0.1"), ep("10.0.0.2")]), factory);

    eventually(|| engine.shard_by_key(b"foo").is_some(), "slot map learned").await;
    assert_eq!(engine.shard_by_key(b"foo"), Some(ShardId(0)));

    let outcome = timeout(
        Duration::from_secs(2),
        engine.submit(
            Command::new(["GET", "foo"]),
            Hint::by_key("foo", RoleRequirement::Any),
        ),
    )
    .await
    .expect("reply in time")
    .expect("engine delivered");
    assert_eq!(outcome, Ok(bulk("ask-served")));

    // ASK never touches slot ownership
    assert_eq!(engine.shard_by_key(b"foo"), Some(ShardId(0)));
    assert_eq!(engine.statistics().engine.redirects_ask, 1);

    engine.stop().await;
}

#[tokio::test]
async fn disconnect_drops_readiness_until_reconnect() {
    let script: Script = Arc::new(|_, words| match words[0].as_str() {
        "CLUSTER" => MockReply::Now(Ok(cluster_slots(&[(0, 16383, "10.0.0.1", &[])]))),
        "GET" => ok_bulk("v"),
        _ => server_error("ERR unknown command"),
    });
    let factory = MockFactory::new(true, script);
    let engine = start_engine(cluster_config(vec![ep("10.0.0.1")]), Arc::clone(&factory));

    assert!(
        engine
            .wait_connected_once(WaitMode::PrimaryOnly, Instant::now() + Duration::from_secs(2))
            .await
    );

    let conn = factory.conn_for("10.0.0.1", 6379).unwrap();
    conn.drop_link();
    eventually(
        || !engine.master_shards()[0].statistics().instances.is_empty()
            && engine.statistics().shards[0].instances[0].state == "pending",
        "gate dropped",
    )
    .await;

    // a submission during the outage queues instead of failing
    let rx = engine.submit(
        Command::new(["GET", "k"]),
        Hint::by_shard(ShardId(0), RoleRequirement::Any),
    );
    tokio::time::sleep(Duration::from_millis(200)).await;

    conn.go_ready();
    let outcome = timeout(Duration::from_secs(2), rx)
        .await
        .expect("reply in time")
        .expect("engine delivered");
    assert_eq!(outcome, Ok(bulk("v")));

    engine.stop().await;
}

#[tokio::test]
async fn unknown_shard_is_rejected_outright() {
    let factory = MockFactory::new(true, two_shard_script());
    let engine = start_engine(cluster_config(vec![ep("10.0.0.1"), ep("10.0.0.2")]), factory);

    let outcome = timeout(
        Duration::from_secs(2),
        engine.submit(
            Command::new(["GET", "x"]),
            Hint::by_shard(ShardId(9), RoleRequirement::Any),
        ),
    )
    .await
    .expect("reply in time")
    .expect("engine delivered");
    assert_eq!(outcome, Err(CommandError::UnknownShard(ShardId(9))));

    engine.stop().await;
}
