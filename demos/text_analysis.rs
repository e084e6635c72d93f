//! Fan-out/fan-in over text segments.
//!
//! One `AnalyzeText` activity per segment extracts key phrases; the orchestration unions
//! the phrase sets with `join_reduce`, so the result is the same whichever segment
//! finishes first.
//!
//! Run with: `cargo run --example text_analysis`

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use duractor::providers::in_memory::InMemoryProvider;
use duractor::runtime::registry::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};
use duractor::runtime::{ActivityContext, Runtime};
use duractor::{Client, DurableOutput, OrchestrationContext, OrchestrationStatus};

/// Stand-in for a key-phrase service: words of four letters or more, lowercased.
fn key_phrases(text: &str) -> BTreeSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 4)
        .map(|w| w.to_lowercase())
        .collect()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(InMemoryProvider::new());

    let activities = ActivityRegistry::builder()
        .register_typed("AnalyzeText", |ctx: ActivityContext, text: String| async move {
            // uneven latency so completions arrive out of order
            tokio::time::sleep(Duration::from_millis((text.len() as u64 * 7) % 50)).await;
            let phrases = key_phrases(&text);
            ctx.trace_info(format!("found {} phrases", phrases.len()));
            Ok(phrases)
        })
        .build();

    let orchestrations = OrchestrationRegistry::builder()
        .register_typed(
            "TextAnalyticsOrchestrator",
            |ctx: OrchestrationContext, segments: Vec<String>| async move {
                duractor::durable_info!(ctx, segments = segments.len(), "analyzing text");
                let mut work = Vec::with_capacity(segments.len());
                for segment in &segments {
                    work.push(ctx.schedule_activity_typed("AnalyzeText", segment)?);
                }
                let phrases = ctx
                    .join_reduce(work, Ok(BTreeSet::new()), |acc: Result<BTreeSet<String>, String>, out| {
                        let mut acc = acc?;
                        let DurableOutput::Activity(result) = out else {
                            return Err("unexpected output kind".to_string());
                        };
                        let set: BTreeSet<String> = serde_json::from_str(&result?).map_err(|e| e.to_string())?;
                        acc.extend(set);
                        Ok(acc)
                    })
                    .await?;
                Ok(phrases)
            },
        )
        .build();

    let rt = Runtime::start_with_store(store, activities, orchestrations, EntityRegistry::builder().build()).await;
    let client = Client::new(rt.clone());

    let segments = vec![
        "Durable orchestrations replay their history".to_string(),
        "Entities process operations strictly in order".to_string(),
        "History makes replay deterministic".to_string(),
    ];
    client
        .start_orchestration_typed("analysis-1", "TextAnalyticsOrchestrator", &segments)
        .await?;

    match client
        .wait_for_orchestration_typed::<BTreeSet<String>>("analysis-1", Duration::from_secs(10))
        .await?
    {
        Ok(phrases) => println!("key phrases: {phrases:?}"),
        Err(e) => println!("analysis failed: {e}"),
    }

    if let OrchestrationStatus::Completed { output } = client.get_orchestration_status("analysis-1").await? {
        println!("recorded output: {output}");
    }
    rt.shutdown().await;
    Ok(())
}
