// End-to-end tests of the action protocol over a real websocket
//
// Each test runs the job control service in-process on an ephemeral port and
// talks to it through ActionClient, the same client the CLI uses.

mod helpers;

use helpers::{collect_for, next_frame, process_is_running, wait_for_frame, ServiceGuard};
use procwatch::supervisor::client::ActionClient;
use procwatch::supervisor::protocol::{
    JobData, JobState, ServerMessage, StateChangedEvent, MAX_REQUEST_FRAME_SIZE,
};
use procwatch::test_utils::{assert_eventually, wait_for_state};
use serde_json::{json, Map, Value};
use std::time::Duration;

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

fn data(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

async fn expect_welcome(client: &mut ActionClient) -> Vec<JobData> {
    match next_frame(client, FRAME_TIMEOUT).await {
        ServerMessage::ProcessSummaryEvent(jobs) => jobs,
        other => panic!("expected a welcome summary, got {:?}", other),
    }
}

async fn add(client: &mut ActionClient, uid: &str, cmd: &str, group: bool) {
    let response = client
        .send_action("add", data(json!({"uid": uid, "cmd": cmd, "group": group})))
        .await
        .expect("add request");
    assert!(response.success, "add failed: {:?}", response);
}

async fn start(client: &mut ActionClient, uid: &str) {
    let response = client
        .send_action("start", data(json!({ "uid": uid })))
        .await
        .expect("start request");
    assert!(response.success, "start failed: {:?}", response);
}

/// State events of `uid` until (and including) `Ended`
async fn states_until_ended(client: &mut ActionClient, uid: &str) -> Vec<StateChangedEvent> {
    let mut events = Vec::new();
    loop {
        let frame = wait_for_frame(client, FRAME_TIMEOUT, "state event", |m| {
            matches!(m, ServerMessage::StateChangedEvent(e) if e.uid == uid)
        })
        .await;
        if let ServerMessage::StateChangedEvent(event) = frame {
            let ended = event.state == JobState::Ended;
            events.push(event);
            if ended {
                return events;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_welcome_and_empty_list() {
    let guard = ServiceGuard::start().await;
    let mut client = guard.connect().await;

    assert!(expect_welcome(&mut client).await.is_empty());

    let response = client.send_action("list", Map::new()).await.unwrap();
    assert!(response.success);
    assert_eq!(response.action, "list");
    assert_eq!(response.uid, None);
    assert_eq!(response.data, json!([]));

    guard.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_keys_are_reported() {
    let guard = ServiceGuard::start().await;
    let mut client = guard.connect().await;
    expect_welcome(&mut client).await;

    let response = client
        .send_action("add", data(json!({"uid": "x"})))
        .await
        .unwrap();
    assert!(!response.success);
    assert_eq!(response.error_message(), Some("missing required keys: cmd, group"));

    let listed = client.send_action("list", Map::new()).await.unwrap();
    assert_eq!(listed.data, json!([]));

    guard.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_frame_keeps_connection_open() {
    let guard = ServiceGuard::start().await;
    let mut client = guard.connect().await;
    expect_welcome(&mut client).await;

    client.send_text("not json".to_string()).await.unwrap();
    let response = client.wait_for_response("invalid").await.unwrap();
    assert!(!response.success);
    assert_eq!(response.action, "invalid");
    assert_eq!(
        response.error_message(),
        Some("Received invalid input: not json")
    );

    client
        .send_text(json!({"action": "frobnicate", "data": {"uid": "x"}}).to_string())
        .await
        .unwrap();
    let response = client.wait_for_response("frobnicate").await.unwrap();
    assert_eq!(response.uid.as_deref(), Some("x"));
    assert_eq!(response.error_message(), Some("Unknown action 'frobnicate'"));

    let listed = client.send_action("list", Map::new()).await.unwrap();
    assert!(listed.success);

    guard.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_frame_is_rejected() {
    let guard = ServiceGuard::start().await;
    let mut client = guard.connect().await;
    expect_welcome(&mut client).await;

    client
        .send_text("x".repeat(MAX_REQUEST_FRAME_SIZE + 1))
        .await
        .unwrap();
    let response = client.wait_for_response("oversized").await.unwrap();
    assert!(!response.success);
    assert!(response.error_message().unwrap().contains("exceeds limit"));

    let listed = client.send_action("list", Map::new()).await.unwrap();
    assert!(listed.success);

    guard.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_stop_emits_lifecycle_events() {
    let guard = ServiceGuard::start().await;
    let mut control = guard.connect().await;
    let mut watcher = guard.connect().await;
    expect_welcome(&mut control).await;
    expect_welcome(&mut watcher).await;

    add(&mut control, "x", "sleep 5", false).await;
    start(&mut control, "x").await;
    wait_for_state(
        guard.service().monitor(),
        "x",
        JobState::Started,
        FRAME_TIMEOUT,
    )
    .await;

    let stopped = control
        .send_action("stop", data(json!({"uid": "x"})))
        .await
        .unwrap();
    assert!(stopped.success, "stop failed: {:?}", stopped);
    assert_eq!(stopped.data, json!(-libc::SIGINT));

    let events = states_until_ended(&mut watcher, "x").await;
    let states: Vec<JobState> = events.iter().map(|e| e.state).collect();
    assert_eq!(
        states,
        vec![
            JobState::Starting,
            JobState::Started,
            JobState::Stopping,
            JobState::Ended
        ]
    );
    assert_eq!(events.last().unwrap().exit_code, Some(-libc::SIGINT));
    assert!(events[..3].iter().all(|e| e.exit_code.is_none()));

    guard.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_every_client_sees_summary_after_change() {
    let guard = ServiceGuard::start().await;
    let mut control = guard.connect().await;
    let mut other = guard.connect().await;
    expect_welcome(&mut control).await;
    expect_welcome(&mut other).await;

    add(&mut control, "web", "sleep 5", true).await;
    start(&mut control, "web").await;

    let has_running_web = |m: &ServerMessage| match m {
        ServerMessage::ProcessSummaryEvent(jobs) => jobs
            .iter()
            .any(|j| j.uid == "web" && j.state != JobState::Initialized),
        _ => false,
    };
    for client in [&mut control, &mut other] {
        wait_for_frame(client, FRAME_TIMEOUT, "summary with 'web'", has_running_web).await;
    }

    guard.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_output_burst_is_coalesced() {
    let guard = ServiceGuard::start().await;
    let mut client = guard.connect().await;
    expect_welcome(&mut client).await;

    let script = "i=1; while [ $i -le 100 ]; do echo line $i; i=$((i+1)); done";
    add(&mut client, "burst", script, false).await;
    start(&mut client, "burst").await;

    let first = wait_for_frame(&mut client, FRAME_TIMEOUT, "output event", |m| {
        matches!(m, ServerMessage::OutputEvent(e) if e.uid == "burst")
    })
    .await;
    let later = collect_for(&mut client, Duration::from_millis(900)).await;

    let mut outputs = vec![first];
    outputs.extend(
        later
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::OutputEvent(e) if e.uid == "burst")),
    );
    assert_eq!(outputs.len(), 1, "expected a single coalesced frame: {:?}", outputs);

    let ServerMessage::OutputEvent(event) = &outputs[0] else {
        unreachable!()
    };
    let expected: String = (1..=100).map(|i| format!("line {}\n", i)).collect();
    assert_eq!(event.output, expected);

    guard.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stubborn_group_is_killed() {
    let guard = ServiceGuard::start().await;
    let mut client = guard.connect().await;
    expect_welcome(&mut client).await;

    add(&mut client, "stubborn", "trap '' INT TERM; sleep 30", true).await;
    start(&mut client, "stubborn").await;
    let running = wait_for_state(
        guard.service().monitor(),
        "stubborn",
        JobState::Started,
        FRAME_TIMEOUT,
    )
    .await;
    let pid = running.pid.expect("started job has a pid");
    assert!(process_is_running(pid));

    let stopped = client
        .send_action("stop", data(json!({"uid": "stubborn"})))
        .await
        .unwrap();
    assert!(stopped.success, "stop failed: {:?}", stopped);
    assert_eq!(stopped.data, json!(-libc::SIGKILL));
    assert!(!process_is_running(pid));

    guard.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_restart_over_socket() {
    let guard = ServiceGuard::start().await;
    let mut client = guard.connect().await;
    expect_welcome(&mut client).await;

    add(&mut client, "r", "sleep 5", true).await;

    let never_started = client
        .send_action("restart", data(json!({"uid": "r"})))
        .await
        .unwrap();
    assert!(!never_started.success);

    start(&mut client, "r").await;
    let first = wait_for_state(guard.service().monitor(), "r", JobState::Started, FRAME_TIMEOUT).await;

    let restarted = client
        .send_action("restart", data(json!({"uid": "r"})))
        .await
        .unwrap();
    assert!(restarted.success, "restart failed: {:?}", restarted);

    let monitor = std::sync::Arc::clone(guard.service().monitor());
    let first_pid = first.pid;
    assert_eventually(
        "restarted job to run with a new pid",
        FRAME_TIMEOUT,
        Duration::from_millis(20),
        move || {
            let monitor = std::sync::Arc::clone(&monitor);
            async move {
                match monitor.job("r") {
                    Some(job) if job.state == JobState::Started && job.pid != first_pid => Ok(()),
                    Some(job) => Err(format!("state {} pid {:?}", job.state, job.pid)),
                    None => Err("job vanished".to_string()),
                }
            }
        },
    )
    .await;

    guard.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_stops_jobs_and_closes_clients() {
    let guard = ServiceGuard::start().await;
    let mut client = guard.connect().await;
    expect_welcome(&mut client).await;

    add(&mut client, "long", "sleep 30", false).await;
    start(&mut client, "long").await;
    let running = wait_for_state(
        guard.service().monitor(),
        "long",
        JobState::Started,
        FRAME_TIMEOUT,
    )
    .await;
    let pid = running.pid.expect("started job has a pid");

    let service = std::sync::Arc::clone(guard.service());
    guard.shutdown().await;

    assert!(!process_is_running(pid));
    let job = service.monitor().job("long").unwrap();
    assert_eq!(job.state, JobState::Ended);
    assert!(job.exit_code.is_some());

    let frames = collect_for(&mut client, Duration::from_secs(2)).await;
    assert!(frames.iter().all(|m| !matches!(m, ServerMessage::ActionResponse(_))));
    assert!(
        tokio::time::timeout(Duration::from_secs(1), client.next_message())
            .await
            .map(|next| !matches!(next, Ok(Some(_))))
            .unwrap_or(false),
        "connection should be closed after shutdown"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_requester_sees_stopping_before_stop_reply() {
    let guard = ServiceGuard::start().await;
    let mut client = guard.connect().await;
    expect_welcome(&mut client).await;

    add(&mut client, "slow", "trap '' INT TERM; sleep 30", true).await;
    start(&mut client, "slow").await;
    wait_for_state(
        guard.service().monitor(),
        "slow",
        JobState::Started,
        FRAME_TIMEOUT,
    )
    .await;

    client
        .send_text(json!({"action": "stop", "data": {"uid": "slow"}}).to_string())
        .await
        .unwrap();

    let mut saw_stopping = false;
    loop {
        match next_frame(&mut client, FRAME_TIMEOUT).await {
            ServerMessage::StateChangedEvent(event)
                if event.uid == "slow" && event.state == JobState::Stopping =>
            {
                saw_stopping = true;
            }
            ServerMessage::ActionResponse(response) => {
                assert_eq!(response.action, "stop");
                assert!(response.success, "stop failed: {:?}", response);
                break;
            }
            _ => {}
        }
    }
    assert!(saw_stopping, "Stopping must reach the requester before the stop reply");

    guard.shutdown().await;
}
