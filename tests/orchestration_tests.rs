use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use duractor::providers::Provider;
use duractor::providers::in_memory::InMemoryProvider;
use duractor::runtime::registry::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};
use duractor::runtime::ActivityContext;
use duractor::{
    AppErrorKind, Client, ClientError, ConfigErrorKind, DurableOutput, ErrorDetails, Event, OrchestrationContext,
    OrchestrationStatus, RetryPolicy,
};

mod common;

async fn client_with(activities: ActivityRegistry, orchestrations: OrchestrationRegistry) -> (Client, Arc<InMemoryProvider>) {
    let store = Arc::new(InMemoryProvider::new());
    let rt = common::start_runtime(store.clone(), activities, orchestrations, EntityRegistry::builder().build()).await;
    (Client::new(rt), store)
}

fn failed_details(status: OrchestrationStatus) -> ErrorDetails {
    match status {
        OrchestrationStatus::Failed { details } => details,
        other => panic!("expected failure, got {other:?}"),
    }
}

#[tokio::test]
async fn sequential_activities_complete() {
    let activities = ActivityRegistry::builder()
        .register("Upper", |_ctx: ActivityContext, s: String| async move { Ok(s.to_uppercase()) })
        .register("Exclaim", |_ctx: ActivityContext, s: String| async move { Ok(format!("{s}!")) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Shout", |ctx: OrchestrationContext, input: String| async move {
            let up = ctx.schedule_activity("Upper", input).into_activity().await?;
            ctx.schedule_activity("Exclaim", up).into_activity().await
        })
        .build();
    let (client, store) = client_with(activities, orchestrations).await;

    client.start_orchestration("shout-1", "Shout", "hey").await.unwrap();
    let status = client.wait_for_orchestration("shout-1", Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, OrchestrationStatus::Completed { output: "HEY!".into() });

    // ids are gap-free and every schedule has exactly one completion
    let history = store.read("shout-1").await.unwrap();
    let ids: Vec<u64> = history.iter().map(|e| e.event_id()).collect();
    assert_eq!(ids, (1..=history.len() as u64).collect::<Vec<_>>());
    assert!(history.last().is_some_and(|e| e.is_terminal()));
}

#[tokio::test]
async fn activity_failure_is_handled_by_code() {
    let activities = ActivityRegistry::builder()
        .register("Fail", |_ctx: ActivityContext, _s: String| async move { Err("nope".to_string()) })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Handles", |ctx: OrchestrationContext, _input: String| async move {
            match ctx.schedule_activity("Fail", "").into_activity().await {
                Ok(_) => Ok("unexpected".to_string()),
                Err(e) => Ok(format!("handled {e}")),
            }
        })
        .register("Propagates", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_activity("Fail", "").into_activity().await
        })
        .build();
    let (client, _store) = client_with(activities, orchestrations).await;

    client.start_orchestration("h-1", "Handles", "").await.unwrap();
    assert_eq!(
        client.wait_for_orchestration("h-1", Duration::from_secs(5)).await.unwrap(),
        OrchestrationStatus::Completed {
            output: "handled nope".into()
        }
    );

    client.start_orchestration("p-1", "Propagates", "").await.unwrap();
    let details = failed_details(client.wait_for_orchestration("p-1", Duration::from_secs(5)).await.unwrap());
    assert_eq!(details, ErrorDetails::application(AppErrorKind::OrchestrationFailed, "nope"));
}

#[tokio::test]
async fn timers_and_select() {
    let activities = ActivityRegistry::builder()
        .register("Slow", |_ctx: ActivityContext, _s: String| async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok("slow".to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Race", |ctx: OrchestrationContext, _input: String| async move {
            let slow = ctx.schedule_activity("Slow", "");
            let timeout = ctx.schedule_timer(Duration::from_millis(50));
            let (winner, out) = ctx.select(vec![slow, timeout]).await;
            match (winner, out) {
                (1, DurableOutput::Timer) => Ok("timed out".to_string()),
                (_, other) => Ok(format!("{other:?}")),
            }
        })
        .register("Sleep", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(Duration::from_millis(30)).into_timer().await;
            Ok("awake".to_string())
        })
        .build();
    let (client, store) = client_with(activities, orchestrations).await;

    client.start_orchestration("sleep-1", "Sleep", "").await.unwrap();
    assert_eq!(
        client.wait_for_orchestration("sleep-1", Duration::from_secs(5)).await.unwrap(),
        OrchestrationStatus::Completed { output: "awake".into() }
    );
    let history = store.read("sleep-1").await.unwrap();
    assert!(history.iter().any(|e| matches!(e, Event::TimerFired { source_event_id: 2, .. })));

    client.start_orchestration("race-1", "Race", "").await.unwrap();
    assert_eq!(
        client.wait_for_orchestration("race-1", Duration::from_secs(5)).await.unwrap(),
        OrchestrationStatus::Completed {
            output: "timed out".into()
        }
    );
}

#[tokio::test]
async fn retry_policy_reschedules_until_success() {
    let attempts = Arc::new(AtomicU32::new(0));
    let seen = attempts.clone();
    let activities = ActivityRegistry::builder()
        .register("Flaky", move |_ctx: ActivityContext, _s: String| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("transient".to_string())
                } else {
                    Ok("finally".to_string())
                }
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Retry", |ctx: OrchestrationContext, _input: String| async move {
            let policy = RetryPolicy::new(5).with_backoff(Duration::from_millis(5), Duration::from_millis(20));
            ctx.schedule_activity_with_retry("Flaky", "", policy).await
        })
        .build();
    let (client, store) = client_with(activities, orchestrations).await;

    client.start_orchestration("retry-1", "Retry", "").await.unwrap();
    assert_eq!(
        client.wait_for_orchestration("retry-1", Duration::from_secs(5)).await.unwrap(),
        OrchestrationStatus::Completed {
            output: "finally".into()
        }
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    let history = store.read("retry-1").await.unwrap();
    let timers = history.iter().filter(|e| matches!(e, Event::TimerCreated { .. })).count();
    assert_eq!(timers, 2);
}

#[tokio::test]
async fn system_activities_record_time_and_guid() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Stamp", |ctx: OrchestrationContext, _input: String| async move {
            let now = ctx.utc_now_ms().await?;
            let guid = ctx.new_guid().await?;
            Ok(format!("{now}|{guid}"))
        })
        .build();
    let (client, _store) = client_with(ActivityRegistry::builder().build(), orchestrations).await;

    client.start_orchestration("stamp-1", "Stamp", "").await.unwrap();
    let OrchestrationStatus::Completed { output } =
        client.wait_for_orchestration("stamp-1", Duration::from_secs(5)).await.unwrap()
    else {
        panic!("stamp did not complete");
    };
    let (now, guid) = output.split_once('|').unwrap();
    assert!(now.parse::<u64>().unwrap() > 1_600_000_000_000);
    assert_eq!(guid.len(), 36);
}

#[tokio::test]
async fn unknown_activity_and_orchestration_fail_with_configuration_errors() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("CallsMissing", |ctx: OrchestrationContext, _input: String| async move {
            // even a handled failure cannot save an unregistered activity
            let _ = ctx.schedule_activity("Missing", "").into_activity().await;
            Ok("done".to_string())
        })
        .build();
    let (client, _store) = client_with(ActivityRegistry::builder().build(), orchestrations).await;

    client.start_orchestration("m-1", "CallsMissing", "").await.unwrap();
    let details = failed_details(client.wait_for_orchestration("m-1", Duration::from_secs(5)).await.unwrap());
    assert_eq!(details, ErrorDetails::unregistered(ConfigErrorKind::UnregisteredActivity, "Missing"));

    client.start_orchestration("m-2", "NoSuchOrchestration", "").await.unwrap();
    let details = failed_details(client.get_orchestration_status("m-2").await.unwrap());
    assert_eq!(details.display_message(), "unregistered orchestration: NoSuchOrchestration");
}

#[tokio::test]
async fn cancellation_fails_a_waiting_instance() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Waits", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(Duration::from_secs(3600)).into_timer().await;
            Ok("never".to_string())
        })
        .build();
    let (client, _store) = client_with(ActivityRegistry::builder().build(), orchestrations).await;

    client.start_orchestration("c-1", "Waits", "").await.unwrap();
    assert_eq!(client.get_orchestration_status("c-1").await.unwrap(), OrchestrationStatus::Running);
    client.cancel_instance("c-1", "user asked").await.unwrap();

    let details = failed_details(client.wait_for_orchestration("c-1", Duration::from_secs(5)).await.unwrap());
    assert_eq!(details.display_message(), "canceled: user asked");
    // terminal states are immutable
    client.cancel_instance("c-1", "again").await.unwrap();
    assert!(matches!(
        client.get_orchestration_status("c-1").await.unwrap(),
        OrchestrationStatus::Failed { .. }
    ));
    assert_eq!(client.cancel_instance("missing", "x").await, Err(ClientError::NotFound));
}

#[tokio::test]
async fn instance_ids_are_unique_and_validated() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Echo", |_ctx: OrchestrationContext, input: String| async move { Ok(input) })
        .build();
    let (client, _store) = client_with(ActivityRegistry::builder().build(), orchestrations).await;

    client.start_orchestration("dup", "Echo", "1").await.unwrap();
    assert_eq!(
        client.start_orchestration("dup", "Echo", "2").await,
        Err(ClientError::InstanceExists { instance: "dup".into() })
    );
    assert!(matches!(
        client.start_orchestration("@counter@x", "Echo", "").await,
        Err(ClientError::InvalidInstance { .. })
    ));

    let generated = client.start_new("Echo", "hi").await.unwrap();
    assert_eq!(
        client.wait_for_orchestration(&generated, Duration::from_secs(5)).await.unwrap(),
        OrchestrationStatus::Completed { output: "hi".into() }
    );
    assert_eq!(
        client.get_orchestration_status("never-started").await.unwrap(),
        OrchestrationStatus::NotFound
    );
    assert_eq!(
        client.wait_for_orchestration("never-started", Duration::from_millis(50)).await,
        Err(ClientError::NotFound)
    );
}

#[tokio::test]
async fn wait_times_out_on_running_instance() {
    let orchestrations = OrchestrationRegistry::builder()
        .register("Waits", |ctx: OrchestrationContext, _input: String| async move {
            ctx.schedule_timer(Duration::from_secs(3600)).into_timer().await;
            Ok(String::new())
        })
        .build();
    let (client, _store) = client_with(ActivityRegistry::builder().build(), orchestrations).await;
    client.start_orchestration("slow-1", "Waits", "").await.unwrap();
    assert_eq!(
        client.wait_for_orchestration("slow-1", Duration::from_millis(50)).await,
        Err(ClientError::Timeout)
    );
}
