use photond::ipc::protocol::{CommandRequest, Request, Response};
use photond::{Daemon, DaemonClient, DaemonConfig, DaemonEvent};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::{tempdir, TempDir};
use tokio::fs;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const TODO: &str = r#"
description = "todo list"

[state]
items = []

[[methods]]
name = "add"
action = "push"
field = "items"

[[methods]]
name = "list"
action = "get"
field = "items"

[[methods]]
name = "boom"
action = "fail"
value = "the list is on fire"

[[methods]]
name = "ping_hook"
action = "echo"
webhook = true
"#;

const SYNC: &str = r#"
[state]
runs = 0

[[methods]]
name = "slow"
action = "increment"
field = "runs"
delay_ms = 150
locked = "sync"
lock_timeout_ms = 2000

[[methods]]
name = "impatient"
action = "increment"
field = "runs"
locked = "sync"
lock_timeout_ms = 100
"#;

const TALLY: &str = r#"
[state]
count = 0

[[methods]]
name = "bump"
action = "increment"
field = "count"
delay_ms = 250
"#;

const WAIT: Duration = Duration::from_secs(5);

struct TestDaemon {
    daemon: Arc<Daemon>,
    handle: JoinHandle<anyhow::Result<()>>,
    socket: std::path::PathBuf,
}

impl TestDaemon {
    async fn start(dir: &Path) -> Self {
        Self::start_with(dir, |_| {}).await
    }

    async fn start_with(dir: &Path, tweak: impl FnOnce(&mut DaemonConfig)) -> Self {
        let mut config = DaemonConfig::with_state_dir(dir);
        config.debounce_ms = 100;
        config.scheduler_tick_secs = 3600;
        tweak(&mut config);
        let socket = config.socket_path();

        let daemon = Daemon::new(config).await.unwrap();
        let handle = daemon.spawn().await.unwrap();
        Self {
            daemon,
            handle,
            socket,
        }
    }

    async fn client(&self) -> DaemonClient {
        DaemonClient::connect(&self.socket).await.unwrap()
    }

    async fn stop(self) {
        self.daemon.shutdown();
        timeout(WAIT, self.handle).await.unwrap().unwrap().unwrap();
    }
}

async fn photon_dir_with(photons: &[(&str, &str)]) -> TempDir {
    let dir = tempdir().unwrap();
    for (name, source) in photons {
        fs::write(dir.path().join(format!("{name}.photon.toml")), source)
            .await
            .unwrap();
    }
    dir
}

async fn command(
    client: &mut DaemonClient,
    photon: &str,
    method: &str,
    args: Value,
    instance: Option<&str>,
) -> Response {
    let mut cmd = CommandRequest::new(client.next_id(), photon, method).with_args(args);
    cmd.session_id = Some(client.session_id().to_string());
    cmd.instance_name = instance.map(str::to_string);
    client.request(&Request::Command(cmd), WAIT).await.unwrap()
}

fn data_of(response: Response) -> Value {
    match response {
        Response::Result { data, .. } => data,
        other => panic!("expected result, got {:?}", other),
    }
}

fn error_code_of(response: Response) -> String {
    match response {
        Response::Error { code, .. } => code,
        other => panic!("expected error, got {:?}", other),
    }
}

async fn publish(client: &mut DaemonClient, channel: &str, message: Value) -> u64 {
    let id = client.next_id();
    let data = client
        .call(&Request::Publish {
            id,
            channel: channel.to_string(),
            message,
            photon_name: None,
        })
        .await
        .unwrap();
    data["eventId"].as_u64().unwrap()
}

async fn next_event(
    events: &mut broadcast::Receiver<DaemonEvent>,
    accept: impl Fn(&DaemonEvent) -> bool,
) -> DaemonEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if accept(&event) {
                return event;
            }
        }
    })
    .await
    .expect("daemon event")
}

fn is_reload_of(photon: &'static str) -> impl Fn(&DaemonEvent) -> bool {
    move |event: &DaemonEvent| match event {
        DaemonEvent::Reloaded { photon: p, .. } | DaemonEvent::ReloadFailed { photon: p, .. } => {
            p == photon
        }
        _ => false,
    }
}

#[tokio::test]
async fn test_ping_and_status() {
    let dir = photon_dir_with(&[("todo", TODO)]).await;
    let daemon = TestDaemon::start(dir.path()).await;
    let mut client = daemon.client().await;

    client.ping().await.unwrap();
    data_of(command(&mut client, "todo", "add", json!({"item": "milk"}), None).await);

    let id = client.next_id();
    let status = client.call(&Request::Status { id }).await.unwrap();
    assert_eq!(status["photons"], json!(["todo"]));
    assert_eq!(status["instances"], json!(1));
    assert_eq!(status["connections"], json!(1));
    assert_eq!(status["driftCorrections"], json!(0));

    daemon.stop().await;
}

#[tokio::test]
async fn test_subscribe_replays_only_missed_events() {
    let dir = tempdir().unwrap();
    let daemon = TestDaemon::start(dir.path()).await;
    let mut publisher = daemon.client().await;
    let mut subscriber = daemon.client().await;

    let mut ids = Vec::new();
    for idx in 0..5 {
        ids.push(publish(&mut publisher, "c", json!({ "idx": idx })).await);
    }

    let id = subscriber.next_id();
    let response = subscriber
        .request(
            &Request::Subscribe {
                id,
                channel: "c".to_string(),
                photon_name: None,
                client_type: Some("beam".to_string()),
                last_event_id: Some(ids[1]),
            },
            WAIT,
        )
        .await
        .unwrap();
    assert_eq!(data_of(response), json!({"subscribed": true, "channel": "c"}));

    // Replay frames were queued ahead of the subscription result
    let replayed: Vec<Value> = subscriber
        .drain_pushes()
        .into_iter()
        .map(|frame| match frame {
            Response::ChannelMessage { message, .. } => message,
            other => panic!("unexpected push {:?}", other),
        })
        .collect();
    assert_eq!(replayed, vec![json!({"idx": 2}), json!({"idx": 3}), json!({"idx": 4})]);

    // Live events follow without duplicates
    publish(&mut publisher, "c", json!({"idx": 5})).await;
    match subscriber.next_push(WAIT).await.unwrap() {
        Some(Response::ChannelMessage { message, event_id, .. }) => {
            assert_eq!(message, json!({"idx": 5}));
            assert_eq!(event_id, ids[4] + 1);
        }
        other => panic!("unexpected push {:?}", other),
    }

    daemon.stop().await;
}

#[tokio::test]
async fn test_overflowed_channel_asks_for_refresh() {
    let dir = tempdir().unwrap();
    let daemon = TestDaemon::start_with(dir.path(), |c| c.channel_buffer_size = 10).await;
    let mut publisher = daemon.client().await;
    let mut subscriber = daemon.client().await;

    for idx in 0..15 {
        publish(&mut publisher, "old", json!({ "idx": idx })).await;
    }

    // lastEventId may arrive as a string
    subscriber
        .send_raw(r#"{"type":"subscribe","id":"s1","channel":"old","lastEventId":"1"}"#)
        .await
        .unwrap();
    let response = subscriber.wait_for("s1", WAIT).await.unwrap();
    assert!(matches!(response, Response::Result { success: Some(true), .. }));

    match subscriber.drain_pushes().as_slice() {
        [Response::RefreshNeeded {
            channel,
            last_event_id,
            oldest_event_id,
            ..
        }] => {
            assert_eq!(channel, "old");
            assert_eq!(*last_event_id, 1);
            assert_eq!(*oldest_event_id, Some(6));
        }
        other => panic!("expected a single refresh_needed, got {:?}", other),
    }

    let id = subscriber.next_id();
    let data = subscriber
        .call(&Request::GetEventsSince {
            id,
            channel: "old".to_string(),
            last_event_id: 1,
        })
        .await
        .unwrap();
    assert_eq!(data, json!({"events": [], "refreshNeeded": true}));

    let id = subscriber.next_id();
    let data = subscriber
        .call(&Request::GetEventsSince {
            id,
            channel: "old".to_string(),
            last_event_id: 0,
        })
        .await
        .unwrap();
    assert_eq!(data, json!({"events": [], "refreshNeeded": false}));

    daemon.stop().await;
}

#[tokio::test]
async fn test_state_changes_reach_other_subscribers_only() {
    let dir = photon_dir_with(&[("todo", TODO)]).await;
    let daemon = TestDaemon::start(dir.path()).await;
    let mut watcher = daemon.client().await;
    let mut actor = daemon.client().await;

    for client in [&mut watcher, &mut actor] {
        let id = client.next_id();
        client
            .call(&Request::Subscribe {
                id,
                channel: "todo".to_string(),
                photon_name: Some("todo".to_string()),
                client_type: None,
                last_event_id: None,
            })
            .await
            .unwrap();
    }

    let data = data_of(command(&mut actor, "todo", "add", json!({"item": "milk"}), None).await);
    assert_eq!(data, json!(["milk"]));

    match watcher.next_push(WAIT).await.unwrap() {
        Some(Response::ChannelMessage { channel, message, .. }) => {
            assert_eq!(channel, "todo");
            assert_eq!(
                message,
                json!({"event": "state-changed", "instance": "default", "method": "add", "data": ["milk"]})
            );
        }
        other => panic!("unexpected push {:?}", other),
    }
    assert!(actor
        .next_push(Duration::from_millis(200))
        .await
        .unwrap()
        .is_none());

    // Reads change nothing and publish nothing
    data_of(command(&mut actor, "todo", "list", json!({}), None).await);
    assert!(watcher
        .next_push(Duration::from_millis(200))
        .await
        .unwrap()
        .is_none());

    daemon.stop().await;
}

#[tokio::test]
async fn test_errors_do_not_close_the_connection() {
    let dir = photon_dir_with(&[("todo", TODO)]).await;
    let daemon = TestDaemon::start(dir.path()).await;
    let mut client = daemon.client().await;

    client.send_raw("{not json").await.unwrap();
    assert_eq!(error_code_of(client.wait_for("", WAIT).await.unwrap()), "protocol_error");

    client.send_raw(r#"{"type":"teleport","id":"t1"}"#).await.unwrap();
    match client.wait_for("t1", WAIT).await.unwrap() {
        Response::Error { error, code, .. } => {
            assert_eq!(code, "protocol_error");
            assert!(error.contains("teleport"));
        }
        other => panic!("unexpected {:?}", other),
    }

    client.send_raw(r#"{"type":"command","id":"t2","method":"add"}"#).await.unwrap();
    assert_eq!(error_code_of(client.wait_for("t2", WAIT).await.unwrap()), "protocol_error");

    let missing = command(&mut client, "ghost", "list", json!({}), None).await;
    assert_eq!(error_code_of(missing), "load_error");

    let unknown = command(&mut client, "todo", "nope", json!({}), None).await;
    assert_eq!(error_code_of(unknown), "not_found");

    match command(&mut client, "todo", "boom", json!({}), None).await {
        Response::Error { error, code, .. } => {
            assert_eq!(code, "invocation_error");
            assert_eq!(error, "the list is on fire");
        }
        other => panic!("unexpected {:?}", other),
    }

    client.ping().await.unwrap();
    daemon.stop().await;
}

#[tokio::test]
async fn test_state_survives_reload() {
    let dir = photon_dir_with(&[("todo", TODO)]).await;
    let daemon = TestDaemon::start(dir.path()).await;
    let mut events = daemon.daemon.subscribe_events();
    let mut client = daemon.client().await;

    data_of(command(&mut client, "todo", "add", json!({"item": "milk"}), None).await);

    let updated = format!("{TODO}\n[[methods]]\nname = \"everything\"\naction = \"get\"\n");
    fs::write(dir.path().join("todo.photon.toml"), updated).await.unwrap();

    match next_event(&mut events, is_reload_of("todo")).await {
        DaemonEvent::Reloaded { migrated, .. } => assert_eq!(migrated, 1),
        other => panic!("reload failed: {:?}", other),
    }

    let items = data_of(command(&mut client, "todo", "list", json!({}), None).await);
    assert_eq!(items, json!(["milk"]));
    let all = data_of(command(&mut client, "todo", "everything", json!({}), None).await);
    assert_eq!(all, json!({"items": ["milk"]}));

    daemon.stop().await;
}

#[tokio::test]
async fn test_bad_edit_keeps_previous_module() {
    let dir = photon_dir_with(&[("todo", TODO)]).await;
    let daemon = TestDaemon::start(dir.path()).await;
    let mut events = daemon.daemon.subscribe_events();
    let mut client = daemon.client().await;

    data_of(command(&mut client, "todo", "add", json!({"item": "milk"}), None).await);
    fs::write(dir.path().join("todo.photon.toml"), "[[methods]\n").await.unwrap();

    assert!(matches!(
        next_event(&mut events, is_reload_of("todo")).await,
        DaemonEvent::ReloadFailed { .. }
    ));
    let items = data_of(command(&mut client, "todo", "list", json!({}), None).await);
    assert_eq!(items, json!(["milk"]));

    daemon.stop().await;
}

#[tokio::test]
async fn test_symlinked_source_reloads_once_per_edit() {
    let dir = tempdir().unwrap();
    let elsewhere = tempdir().unwrap();
    let real = elsewhere.path().join("todo.photon.toml");
    fs::write(&real, TODO).await.unwrap();
    std::os::unix::fs::symlink(&real, dir.path().join("todo.photon.toml")).unwrap();

    let daemon = TestDaemon::start(dir.path()).await;
    let mut events = daemon.daemon.subscribe_events();
    let mut client = daemon.client().await;
    data_of(command(&mut client, "todo", "add", json!({"item": "milk"}), None).await);

    // A burst of saves inside one debounce window
    let updated = format!("{TODO}\n[[methods]]\nname = \"everything\"\naction = \"get\"\n");
    for _ in 0..3 {
        fs::write(&real, &updated).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(matches!(
        next_event(&mut events, is_reload_of("todo")).await,
        DaemonEvent::Reloaded { .. }
    ));
    assert!(
        timeout(Duration::from_millis(600), events.recv()).await.is_err(),
        "one burst must trigger exactly one reload"
    );

    let all = data_of(command(&mut client, "todo", "everything", json!({}), None).await);
    assert_eq!(all, json!({"items": ["milk"]}));

    daemon.stop().await;
}

#[tokio::test]
async fn test_atomic_save_and_delete_recreate() {
    let dir = photon_dir_with(&[("todo", TODO)]).await;
    let daemon = TestDaemon::start(dir.path()).await;
    let mut events = daemon.daemon.subscribe_events();
    let mut client = daemon.client().await;
    let source = dir.path().join("todo.photon.toml");
    data_of(command(&mut client, "todo", "add", json!({"item": "milk"}), None).await);

    // Editor-style save: write a temp file, rename it over the source
    let v2 = format!("{TODO}\n[[methods]]\nname = \"v2\"\naction = \"get\"\n");
    let tmp = dir.path().join(".todo.swp");
    fs::write(&tmp, &v2).await.unwrap();
    fs::rename(&tmp, &source).await.unwrap();
    assert!(matches!(
        next_event(&mut events, is_reload_of("todo")).await,
        DaemonEvent::Reloaded { .. }
    ));

    // Delete, then recreate: the watch survives and the module stays usable meanwhile
    fs::remove_file(&source).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    data_of(command(&mut client, "todo", "v2", json!({}), None).await);

    let v3 = format!("{TODO}\n[[methods]]\nname = \"v3\"\naction = \"get\"\n");
    fs::write(&source, &v3).await.unwrap();
    assert!(matches!(
        next_event(&mut events, is_reload_of("todo")).await,
        DaemonEvent::Reloaded { .. }
    ));
    let state = data_of(command(&mut client, "todo", "v3", json!({}), None).await);
    assert_eq!(state, json!({"items": ["milk"]}));

    daemon.stop().await;
}

#[tokio::test]
async fn test_locked_methods_never_overlap() {
    let dir = photon_dir_with(&[("sync", SYNC)]).await;
    let daemon = TestDaemon::start(dir.path()).await;
    let mut a = daemon.client().await;
    let mut b = daemon.client().await;

    let started = Instant::now();
    let (ra, rb) = tokio::join!(
        command(&mut a, "sync", "slow", json!({}), Some("a")),
        command(&mut b, "sync", "slow", json!({}), Some("b")),
    );
    data_of(ra);
    data_of(rb);
    // Different instances, same lock name: the calls ran one after the other
    assert!(started.elapsed() >= Duration::from_millis(300));

    daemon.stop().await;
}

#[tokio::test]
async fn test_same_instance_runs_in_arrival_order_other_instances_overlap() {
    let dir = photon_dir_with(&[("tally", TALLY)]).await;
    let daemon = TestDaemon::start(dir.path()).await;
    let mut a = daemon.client().await;
    let mut b = daemon.client().await;

    // Same key: the second call queues behind the first
    let started = Instant::now();
    let (first, second) = tokio::join!(
        command(&mut a, "tally", "bump", json!({}), None),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            command(&mut b, "tally", "bump", json!({}), None).await
        },
    );
    assert_eq!(data_of(first), json!(1));
    assert_eq!(data_of(second), json!(2));
    assert!(started.elapsed() >= Duration::from_millis(500));

    // Different keys: the calls run side by side
    let started = Instant::now();
    let (left, right) = tokio::join!(
        command(&mut a, "tally", "bump", json!({}), Some("left")),
        command(&mut b, "tally", "bump", json!({}), Some("right")),
    );
    assert_eq!(data_of(left), json!(1));
    assert_eq!(data_of(right), json!(1));
    assert!(started.elapsed() < Duration::from_millis(450));

    daemon.stop().await;
}

#[tokio::test]
async fn test_lock_timeout_fails_fast_and_disconnect_releases() {
    let dir = photon_dir_with(&[("sync", SYNC)]).await;
    let daemon = TestDaemon::start(dir.path()).await;
    let mut holder = daemon.client().await;
    let mut other = daemon.client().await;

    let id = holder.next_id();
    holder
        .call(&Request::Lock {
            id,
            lock_name: "sync".to_string(),
            timeout: Some(1000),
        })
        .await
        .unwrap();

    let started = Instant::now();
    let response = command(&mut other, "sync", "impatient", json!({}), None).await;
    assert_eq!(error_code_of(response), "lock_timeout");
    assert!(started.elapsed() < Duration::from_secs(2));

    // The holder itself is not blocked by its own lock
    data_of(command(&mut holder, "sync", "impatient", json!({}), None).await);

    drop(holder);
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = data_of(command(&mut other, "sync", "impatient", json!({}), None).await);
    assert_eq!(after, json!(2));

    daemon.stop().await;
}

#[tokio::test]
async fn test_drift_corrected_only_with_hint() {
    let dir = photon_dir_with(&[("todo", TODO)]).await;

    {
        let daemon = TestDaemon::start(dir.path()).await;
        let mut client = daemon.client().await;
        data_of(command(&mut client, "todo", "_use", json!({"name": "macha"}), None).await);
        data_of(command(&mut client, "todo", "add", json!({"item": "tea"}), None).await);
        daemon.stop().await;
    }

    // Restarted daemon: its current instance is the default again
    let daemon = TestDaemon::start(dir.path()).await;
    let mut events = daemon.daemon.subscribe_events();
    let mut client = daemon.client().await;

    let items = data_of(command(&mut client, "todo", "list", json!({}), Some("macha")).await);
    assert_eq!(items, json!(["tea"]));
    assert_eq!(
        next_event(&mut events, |e| matches!(e, DaemonEvent::DriftCorrected { .. })).await,
        DaemonEvent::DriftCorrected {
            photon: "todo".to_string(),
            from: "default".to_string(),
            to: "macha".to_string(),
        }
    );
    assert_eq!(daemon.daemon.registry().drift_corrections(), 1);

    // A fresh session without the hint lands on the daemon's current instance, uncounted
    let mut fresh = daemon.client().await;
    data_of(command(&mut fresh, "todo", "list", json!({}), None).await);
    assert_eq!(daemon.daemon.registry().drift_corrections(), 1);

    let listed = data_of(command(&mut fresh, "todo", "_instances", json!({}), None).await);
    assert_eq!(listed["instances"], json!(["macha"]));

    daemon.stop().await;
}

#[tokio::test]
async fn test_schedule_and_webhook_requests() {
    let dir = photon_dir_with(&[("todo", TODO)]).await;
    let daemon = TestDaemon::start(dir.path()).await;
    let mut client = daemon.client().await;

    let id = client.next_id();
    let scheduled = client
        .call(&Request::Schedule {
            id,
            photon_name: "todo".to_string(),
            photon_path: None,
            job_id: Some("nightly".to_string()),
            method: "add".to_string(),
            cron: "0 3 * * *".to_string(),
            args: json!({"item": "water plants"}),
            instance_name: None,
        })
        .await
        .unwrap();
    assert_eq!(scheduled["jobId"], "nightly");

    let id = client.next_id();
    let bad_cron = client
        .request(
            &Request::Schedule {
                id,
                photon_name: "todo".to_string(),
                photon_path: None,
                job_id: None,
                method: "add".to_string(),
                cron: "whenever".to_string(),
                args: Value::Null,
                instance_name: None,
            },
            WAIT,
        )
        .await
        .unwrap();
    assert_eq!(error_code_of(bad_cron), "protocol_error");

    let id = client.next_id();
    let jobs = client.call(&Request::ListJobs { id }).await.unwrap();
    assert_eq!(jobs["jobs"].as_array().map(Vec::len), Some(1));

    let id = client.next_id();
    let removed = client
        .call(&Request::Unschedule {
            id,
            job_id: "nightly".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(removed["unscheduled"], json!(true));

    let hook = CommandRequest::new("w1", "todo", "ping_hook").with_args(json!({"x": 1}));
    assert_eq!(client.call(&Request::Webhook(hook)).await.unwrap(), json!({"x": 1}));
    let denied = CommandRequest::new("w2", "todo", "add").with_args(json!({"item": "x"}));
    let response = client.request(&Request::Webhook(denied), WAIT).await.unwrap();
    assert_eq!(error_code_of(response), "protocol_error");

    daemon.stop().await;
}

#[tokio::test]
async fn test_shutdown_request_removes_socket() {
    let dir = tempdir().unwrap();
    let daemon = TestDaemon::start(dir.path()).await;
    let socket = daemon.socket.clone();
    assert!(socket.exists());

    let mut client = daemon.client().await;
    let id = client.next_id();
    let ack = client.call(&Request::Shutdown { id }).await.unwrap();
    assert_eq!(ack, json!({"shuttingDown": true}));

    timeout(WAIT, daemon.handle).await.unwrap().unwrap().unwrap();
    assert!(!socket.exists());
}
