//! Counter entity on a file-backed store.
//!
//! Signals are acknowledged once recorded, calls wait for the result, and the state
//! survives a runtime restart over the same directory.
//!
//! Run with: `cargo run --example counter_entity`

use std::sync::Arc;

use duractor::EntityId;
use duractor::providers::fs::FsProvider;
use duractor::runtime::Runtime;
use duractor::runtime::registry::{ActivityRegistry, EntityRegistry, OrchestrationRegistry};
use duractor::Client;

fn counter() -> EntityRegistry {
    EntityRegistry::builder()
        .register_typed::<i64, _>("counter", |count, operation, input| match operation {
            "add" => {
                *count += input.parse::<i64>().map_err(|e| format!("bad amount '{input}': {e}"))?;
                Ok(None)
            }
            "reset" => {
                *count = 0;
                Ok(None)
            }
            "get" => Ok(Some(count.to_string())),
            other => Err(format!("unknown operation {other}")),
        })
        .build()
}

async fn start(dir: &std::path::Path) -> Arc<Runtime> {
    let store = Arc::new(FsProvider::new(dir, false));
    Runtime::start_with_store(
        store,
        ActivityRegistry::builder().build(),
        OrchestrationRegistry::builder().build(),
        counter(),
    )
    .await
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempfile::tempdir()?;
    let id = EntityId::new("counter", "visits");

    let rt = start(dir.path()).await;
    let client = Client::new(rt.clone());
    client.signal_entity(&id, "add", "5").await?;
    client.signal_entity(&id, "add", "-2").await?;
    println!("get -> {:?}", client.call_entity(&id, "get", "").await?);

    // a failing operation leaves the state alone
    if let Err(e) = client.call_entity(&id, "add", "lots").await {
        println!("add(lots) failed: {e}");
    }
    rt.shutdown().await;

    let rt = start(dir.path()).await;
    let client = Client::new(rt.clone());
    println!("after restart -> {:?}", client.read_entity_state(&id).await?);

    client.delete_entity(&id).await?;
    println!("after delete -> {:?}", client.call_entity(&id, "get", "").await?);
    rt.shutdown().await;
    Ok(())
}
