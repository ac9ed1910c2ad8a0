use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::sleep;

use colloquy::config::SystemConfig;
use colloquy::event::event_bus::{Event, EventHandler, HandlerPriority, Value};
use colloquy::event::names;
use colloquy::provider::EchoProvider;
use colloquy::system::System;

fn recording_handler(log: Arc<Mutex<Vec<Event>>>) -> EventHandler {
    Arc::new(move |event| {
        let log = log.clone();
        Box::pin(async move {
            log.lock().unwrap().push(event);
            Ok(Value::Null)
        })
    })
}

#[tokio::test]
async fn test_foreign_lock_holder_forks_then_yields() {
    let config = SystemConfig {
        lock_retry_interval: Duration::from_millis(20),
        ..SystemConfig::default()
    };
    let system = System::new(config, Arc::new(EchoProvider::new("echo")));
    system.clone().start();

    let forks = Arc::new(Mutex::new(Vec::new()));
    let results = Arc::new(Mutex::new(Vec::new()));
    system.event_bus().register(
        names::CONVERSATION_FORK_DETECTED,
        HandlerPriority::Normal,
        None,
        recording_handler(forks.clone()),
    );
    system.event_bus().register(
        names::COMPLETION_RESULT,
        HandlerPriority::Normal,
        None,
        recording_handler(results.clone()),
    );

    // An unrelated chain holds the conversation before any submission.
    let locks = system.locks();
    locks
        .acquire("c1", "external-req", "external-chain", None)
        .await;

    system
        .emit(
            Event::new(names::COMPLETION_SUBMIT)
                .with("conversation_id", "c1")
                .with("prompt_ref", "p"),
        )
        .await;
    sleep(Duration::from_millis(150)).await;

    // The worker's claim is a fork (published exactly once despite retries)
    // and the request is parked, not dropped.
    {
        let forks = forks.lock().unwrap();
        assert_eq!(forks.len(), 1);
        assert_eq!(forks[0].get_str("conversation_id"), Some("c1"));
        assert_eq!(forks[0].get_str("holder_request_id"), Some("external-req"));
        assert_eq!(forks[0].payload.get("reclaimed"), Some(&Value::Boolean(false)));
    }
    assert!(results.lock().unwrap().is_empty());

    // The status query exposes the full fork history, not just a count.
    let responses = system
        .emit(Event::new(names::CONVERSATION_LOCK_STATUS).with("conversation_id", "c1"))
        .await;
    match responses[0].outcome.as_ref().unwrap() {
        Value::Map(map) => match map.get("forks") {
            Some(Value::List(entries)) => {
                assert_eq!(entries.len(), 1);
                match &entries[0] {
                    Value::Map(fork) => {
                        assert_eq!(
                            fork.get("holder_request_id"),
                            Some(&Value::from("external-req"))
                        );
                        assert_eq!(fork.get("reclaimed"), Some(&Value::Boolean(false)));
                        assert!(fork.contains_key("claimant_request_id"));
                        assert!(fork.contains_key("detected_at"));
                    }
                    other => panic!("expected fork record map, got {:?}", other),
                }
            }
            other => panic!("expected fork list, got {:?}", other),
        },
        other => panic!("expected map, got {:?}", other),
    }

    locks.release("c1", "external-req");
    sleep(Duration::from_millis(150)).await;

    let results = results.lock().unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].get_str("output"), Some("echo: p"));

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_expired_lock_is_reclaimed_and_recorded() {
    let system = System::new(SystemConfig::default(), Arc::new(EchoProvider::new("echo")));
    system.clone().start();

    let forks = Arc::new(Mutex::new(Vec::new()));
    let results = Arc::new(Mutex::new(Vec::new()));
    system.event_bus().register(
        names::CONVERSATION_FORK_DETECTED,
        HandlerPriority::Normal,
        None,
        recording_handler(forks.clone()),
    );
    system.event_bus().register(
        names::COMPLETION_RESULT,
        HandlerPriority::Normal,
        None,
        recording_handler(results.clone()),
    );

    // A stale holder that never released: its ttl lapses immediately.
    let locks = system.locks();
    locks
        .acquire("c1", "stale-req", "stale-chain", Some(Duration::ZERO))
        .await;
    sleep(Duration::from_millis(10)).await;

    system
        .emit(
            Event::new(names::COMPLETION_SUBMIT)
                .with("conversation_id", "c1")
                .with("prompt_ref", "p"),
        )
        .await;
    sleep(Duration::from_millis(200)).await;

    // Reclamation succeeded and was recorded as a potential fork.
    assert_eq!(results.lock().unwrap().len(), 1);
    let forks = forks.lock().unwrap();
    assert_eq!(forks.len(), 1);
    assert_eq!(forks[0].payload.get("reclaimed"), Some(&Value::Boolean(true)));
    assert_eq!(forks[0].get_str("holder_request_id"), Some("stale-req"));

    let history = locks.status("c1");
    assert_eq!(history.forks.len(), 1);
    assert!(history.forks[0].reclaimed);

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_long_lock_wait_publishes_single_timeout_notice() {
    let config = SystemConfig {
        lock_retry_interval: Duration::from_millis(10),
        lock_wait_timeout: Duration::from_millis(40),
        ..SystemConfig::default()
    };
    let system = System::new(config, Arc::new(EchoProvider::new("echo")));
    system.clone().start();

    let timeouts = Arc::new(Mutex::new(Vec::new()));
    let results = Arc::new(Mutex::new(Vec::new()));
    system.event_bus().register(
        names::COMPLETION_LOCK_TIMEOUT,
        HandlerPriority::Normal,
        None,
        recording_handler(timeouts.clone()),
    );
    system.event_bus().register(
        names::COMPLETION_RESULT,
        HandlerPriority::Normal,
        None,
        recording_handler(results.clone()),
    );

    let locks = system.locks();
    locks
        .acquire("c1", "external-req", "external-chain", None)
        .await;
    system
        .emit(
            Event::new(names::COMPLETION_SUBMIT)
                .with("conversation_id", "c1")
                .with("prompt_ref", "p"),
        )
        .await;
    sleep(Duration::from_millis(250)).await;

    // One informational notice despite many retries past the timeout.
    {
        let timeouts = timeouts.lock().unwrap();
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].get_str("conversation_id"), Some("c1"));
    }
    assert!(results.lock().unwrap().is_empty());

    // The claim was never abandoned.
    locks.release("c1", "external-req");
    sleep(Duration::from_millis(150)).await;
    assert_eq!(results.lock().unwrap().len(), 1);

    system.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lock_status_query_reflects_in_flight_work() {
    let provider = Arc::new(EchoProvider::new("slow").with_latency(Duration::from_millis(300)));
    let system = System::new(SystemConfig::default(), provider);
    system.clone().start();

    system
        .emit(
            Event::new(names::COMPLETION_SUBMIT)
                .with("conversation_id", "c1")
                .with("prompt_ref", "p"),
        )
        .await;
    sleep(Duration::from_millis(100)).await;

    let responses = system
        .emit(Event::new(names::CONVERSATION_LOCK_STATUS).with("conversation_id", "c1"))
        .await;
    match responses[0].outcome.as_ref().unwrap() {
        Value::Map(map) => {
            assert_eq!(map.get("locked"), Some(&Value::Boolean(true)));
            assert_eq!(map.get("forks"), Some(&Value::List(Vec::new())));
        }
        other => panic!("expected map, got {:?}", other),
    }

    // Missing conversation_id is a payload error.
    let responses = system.emit(Event::new(names::CONVERSATION_LOCK_STATUS)).await;
    assert!(responses[0].outcome.is_err());

    sleep(Duration::from_millis(400)).await;
    let responses = system
        .emit(Event::new(names::CONVERSATION_LOCK_STATUS).with("conversation_id", "c1"))
        .await;
    match responses[0].outcome.as_ref().unwrap() {
        Value::Map(map) => assert_eq!(map.get("locked"), Some(&Value::Boolean(false))),
        other => panic!("expected map, got {:?}", other),
    }

    system.shutdown().await.unwrap();
}
