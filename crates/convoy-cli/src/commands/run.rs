use super::{
    build_engine, ensure_prereqs, load_fleet, lock_store, open_store, store_path, Globals,
    EXIT_SUCCESS,
};
use convoy_core::{shutdown_requested, EventSink, LogSink, WatchEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tracing::{info, warn};

/// Prints every engine event as one JSON document per line.
pub struct JsonLinesSink;

impl EventSink for JsonLinesSink {
    fn emit(&self, event: WatchEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!("cannot serialize event: {e}"),
        }
    }
}

pub fn run(runtime: &Runtime, globals: &Globals) -> Result<u8, String> {
    let fleet = load_fleet(&globals.config, true)?;
    ensure_prereqs(&fleet)?;
    let store_path = store_path(globals, &fleet);
    let store = open_store(&store_path)?;
    let _lock = lock_store(&store_path)?;

    let events: Arc<dyn EventSink> = if globals.json {
        Arc::new(JsonLinesSink)
    } else {
        Arc::new(LogSink)
    };
    let engine = build_engine(&fleet, store, events, true)?;

    runtime.block_on(async {
        let summary = engine
            .register_watchers()
            .await
            .map_err(|e| e.to_string())?;
        if summary.watchers == 0 {
            warn!(
                "no watchers registered; add enabled [[devices]] to {}",
                globals.config.display()
            );
        }
        info!(
            "watching {} device(s) with {} watcher(s), store {}",
            summary.devices,
            summary.watchers,
            store_path.display()
        );

        let mut ticker = tokio::time::interval(Duration::from_millis(250));
        while !shutdown_requested() {
            ticker.tick().await;
        }

        info!("shutting down");
        let stopped = engine.deregister_all();
        info!("stopped {stopped} watcher(s)");
        Ok::<(), String>(())
    })?;

    Ok(EXIT_SUCCESS)
}
