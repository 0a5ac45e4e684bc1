//! Watch command implementation.

use super::{open_existing, signal_dir, value_to_json};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tabsync_observe::{ChangeBatch, Coordinator, LifecycleEvent, ObserveConfig, SharedDirNotifier};

/// Runs the watch command.
pub fn run(path: &Path, seconds: Option<u64>) -> Result<(), Box<dyn std::error::Error>> {
    let db = Arc::new(open_existing(path)?);
    let notifier = Arc::new(SharedDirNotifier::open(&signal_dir(path))?);
    let coordinator = Coordinator::new(db, ObserveConfig::default(), notifier)?;
    coordinator.on_changes(print_batch);
    let events = coordinator.subscribe_events();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let node = coordinator.start().await?;
        println!("Watching as {node} (master: {})", coordinator.is_master());

        let deadline = seconds.map(|s| tokio::time::Instant::now() + Duration::from_secs(s));
        let mut was_master = coordinator.is_master();
        loop {
            let tick = tokio::time::sleep(Duration::from_millis(200));
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                () = tick => {}
            }
            for event in events.try_iter() {
                match event {
                    LifecycleEvent::Cleanup { .. } => {
                        let is_master = coordinator.is_master();
                        if is_master != was_master {
                            println!("Mastership: {}", if is_master { "acquired" } else { "lost" });
                            was_master = is_master;
                        }
                    }
                    LifecycleEvent::Evicted => {
                        println!("Evicted by a peer");
                        return Ok(());
                    }
                    LifecycleEvent::Stopped => return Ok(()),
                }
            }
            if deadline.is_some_and(|d| tokio::time::Instant::now() >= d) {
                break;
            }
        }
        coordinator.stop();
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;
    Ok(())
}

fn print_batch(batch: &ChangeBatch) {
    for change in &batch.changes {
        let value = change
            .new_value
            .as_ref()
            .or(change.old_value.as_ref())
            .map(|v| value_to_json(v).to_string())
            .unwrap_or_default();
        println!(
            "{:>8} {:<6} {}[{}] {}",
            change.revision.as_u64(),
            change.kind,
            change.table,
            value_to_json(&change.key),
            value
        );
    }
    if batch.partial {
        println!("         ... more changes follow");
    }
}
