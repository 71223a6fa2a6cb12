use super::{
    build_engine, colorize_status, ensure_prereqs, json_pretty, load_fleet, lock_store,
    open_store, spin_fail, spin_ok, spinner, store_path, Globals, EXIT_FAILURE, EXIT_SUCCESS,
};
use convoy_core::{ChangeEvent, ChangeKind, CoreError, EventSink, PollOutcome, PollReport, RecordingSink};
use convoy_schema::DeviceUuid;
use std::sync::Arc;
use tokio::runtime::Runtime;

struct Failure {
    watcher: String,
    error: String,
}

pub fn run(runtime: &Runtime, globals: &Globals, device: &str) -> Result<u8, String> {
    let fleet = load_fleet(&globals.config, true)?;
    let entry = fleet.device(&DeviceUuid::new(device)).ok_or_else(|| {
        format!(
            "config error: no device '{device}' in {}",
            globals.config.display()
        )
    })?;
    if !entry.device.enabled {
        if !globals.json {
            println!("device '{device}' is disabled, nothing to poll");
        }
        return Ok(EXIT_SUCCESS);
    }
    ensure_prereqs(&fleet)?;

    let store_path = store_path(globals, &fleet);
    let store = open_store(&store_path)?;
    let _lock = lock_store(&store_path)?;
    let sink = Arc::new(RecordingSink::new());
    let engine = build_engine(
        &fleet,
        store,
        Arc::clone(&sink) as Arc<dyn EventSink>,
        false,
    )?;

    let pb = (!globals.json).then(|| spinner(&format!("polling {device}...")));
    let (reports, failures) = runtime
        .block_on(async {
            let keys = engine.register_watcher(&entry.device).await?;
            let mut reports = Vec::new();
            let mut failures = Vec::new();
            for key in &keys {
                match engine.refresh(key).await {
                    Ok(PollOutcome::Completed(report)) => reports.push(report),
                    Ok(PollOutcome::Skipped) => {}
                    Err(e) => failures.push(Failure {
                        watcher: key.to_string(),
                        error: e.to_string(),
                    }),
                }
            }
            engine.deregister_all();
            Ok::<_, CoreError>((reports, failures))
        })
        .map_err(|e| e.to_string())?;

    let changes = sink.changes();
    if globals.json {
        let payload = serde_json::json!({
            "device": device,
            "reports": reports,
            "changes": changes,
            "failures": failures
                .iter()
                .map(|f| serde_json::json!({"watcher": f.watcher, "error": f.error}))
                .collect::<Vec<_>>(),
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        if let Some(pb) = &pb {
            if failures.is_empty() {
                spin_ok(pb, &format!("polled {device}"));
            } else {
                spin_fail(pb, &format!("{} watcher(s) of {device} failed", failures.len()));
            }
        }
        print_reports(&reports, &changes);
        for failure in &failures {
            println!("  {}: {}", failure.watcher, failure.error);
        }
    }

    Ok(if failures.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    })
}

fn print_reports(reports: &[PollReport], changes: &[ChangeEvent]) {
    for report in reports {
        let r = &report.reconcile;
        println!(
            "  {}: {} listed, {} created, {} updated, {} deleted, {} unchanged ({} ms)",
            report.watcher,
            report.listed,
            r.created,
            r.updated,
            r.deleted,
            r.unchanged,
            report.duration_ms
        );
        if !report.failed_scopes.is_empty() {
            println!(
                "    unreachable: {} ({} row(s) kept)",
                report.failed_scopes.join(", "),
                r.preserved
            );
        }
    }
    for change in changes {
        let sign = match change.change {
            ChangeKind::Created => '+',
            ChangeKind::Updated => '~',
            ChangeKind::Deleted => '-',
        };
        let c = &change.container;
        println!(
            "    {sign} {:<24} {:<12} {}",
            c.name,
            colorize_status(&c.status),
            c.uuid
        );
    }
}
