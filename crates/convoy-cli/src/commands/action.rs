use super::{
    build_engine, ensure_prereqs, json_pretty, load_fleet, lock_store, open_store, spin_fail,
    spin_ok, spinner, store_path, Globals, EXIT_SUCCESS,
};
use convoy_core::{CoreError, LogSink};
use convoy_schema::{ContainerAction, ContainerUuid};
use convoy_store::ContainerRepository;
use std::sync::Arc;
use tokio::runtime::Runtime;

pub fn run(
    runtime: &Runtime,
    globals: &Globals,
    container: &str,
    action: &str,
) -> Result<u8, String> {
    let action: ContainerAction = action.parse().map_err(|e| format!("{e}"))?;
    let fleet = load_fleet(&globals.config, true)?;
    let store_path = store_path(globals, &fleet);
    let store = open_store(&store_path)?;

    let row = store
        .find_by_uuid(&ContainerUuid::new(container))
        .map_err(|e| format!("store error: {e}"))?
        .ok_or_else(|| format!("no container with uuid '{container}' in the inventory"))?;
    let entry = fleet.device(&row.device_uuid).ok_or_else(|| {
        format!(
            "config error: device '{}' owning {} is not in {}",
            row.device_uuid,
            row.name,
            globals.config.display()
        )
    })?;
    ensure_prereqs(&fleet)?;
    let _lock = lock_store(&store_path)?;
    let engine = build_engine(&fleet, store, Arc::new(LogSink), false)?;

    let pb = (!globals.json).then(|| spinner(&format!("{action} {}...", row.name)));
    let result = runtime.block_on(async {
        engine.register_watcher(&entry.device).await?;
        let outcome = engine.change_container_status(&row.uuid, action).await;
        engine.deregister_all();
        outcome
    });

    match result {
        Ok(()) => {
            if globals.json {
                let payload = serde_json::json!({
                    "container": row.uuid,
                    "name": row.name,
                    "action": action.to_string(),
                    "acknowledged": true,
                });
                println!("{}", json_pretty(&payload)?);
            } else if let Some(pb) = &pb {
                spin_ok(pb, &format!("{action} acknowledged for {}", row.name));
            }
            Ok(EXIT_SUCCESS)
        }
        Err(e) => {
            if let Some(pb) = &pb {
                spin_fail(pb, &format!("{action} failed for {}", row.name));
            }
            Err(match e {
                CoreError::WatcherNotFound(key) => format!(
                    "{} is no longer watched by {key}; check the device capabilities",
                    row.name
                ),
                other => other.to_string(),
            })
        }
    }
}
