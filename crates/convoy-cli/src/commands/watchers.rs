use super::{
    build_engine, colorize_state, ensure_prereqs, json_pretty, load_fleet, lock_store,
    open_store, spin_ok, spinner, store_path, Globals, EXIT_FAILURE, EXIT_SUCCESS,
};
use convoy_core::{CoreError, LogSink, WatcherSnapshot, WatcherState};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::debug;

pub fn run(runtime: &Runtime, globals: &Globals) -> Result<u8, String> {
    let fleet = load_fleet(&globals.config, true)?;
    ensure_prereqs(&fleet)?;
    let store_path = store_path(globals, &fleet);
    let store = open_store(&store_path)?;
    let _lock = lock_store(&store_path)?;
    let engine = build_engine(&fleet, store, Arc::new(LogSink), false)?;

    let pb = (!globals.json).then(|| spinner("polling every device..."));
    let (summary, state) = runtime
        .block_on(async {
            let summary = engine.register_watchers().await?;
            for key in engine.keys() {
                if let Err(e) = engine.refresh(&key).await {
                    debug!("{key}: {e}");
                }
            }
            let state = engine.get_state();
            engine.deregister_all();
            Ok::<_, CoreError>((summary, state))
        })
        .map_err(|e| e.to_string())?;
    if let Some(pb) = &pb {
        spin_ok(pb, &format!("polled {} watcher(s)", state.len()));
    }

    if globals.json {
        let payload = serde_json::json!({
            "summary": summary,
            "watchers": state,
        });
        println!("{}", json_pretty(&payload)?);
    } else if state.is_empty() {
        println!("no watchers registered");
    } else {
        print_table(&state);
    }

    let failed = state.iter().any(|s| s.state == WatcherState::Error);
    Ok(if failed { EXIT_FAILURE } else { EXIT_SUCCESS })
}

fn print_table(state: &[WatcherSnapshot]) {
    println!(
        "{:<28} {:<8} {:<11} {:>8} {:>7}  LAST ERROR",
        "WATCHER", "KIND", "STATE", "INTERVAL", "LISTED"
    );
    for snap in state {
        let listed = snap
            .last_report
            .as_ref()
            .map_or_else(|| "-".to_owned(), |r| r.listed.to_string());
        println!(
            "{:<28} {:<8} {:<11} {:>7}s {:>7}  {}",
            snap.key.as_str(),
            snap.kind.to_string(),
            colorize_state(snap.state.as_str()),
            snap.interval_secs,
            listed,
            snap.last_error.as_deref().unwrap_or("")
        );
    }
}
