use super::{colorize_status, json_pretty, load_fleet, open_store, store_path, Globals, EXIT_SUCCESS};
use convoy_schema::WatcherName;
use convoy_store::ContainerRepository;

pub fn run(globals: &Globals, watcher: Option<&str>) -> Result<u8, String> {
    let fleet = load_fleet(&globals.config, false)?;
    let store = open_store(&store_path(globals, &fleet))?;

    let mut rows = match watcher {
        Some(name) => store.find_by_watcher(&WatcherName::new(name)),
        None => store.list(),
    }
    .map_err(|e| format!("store error: {e}"))?;
    rows.sort_by(|a, b| a.watcher.cmp(&b.watcher).then_with(|| a.name.cmp(&b.name)));

    if globals.json {
        println!("{}", json_pretty(&rows)?);
    } else if rows.is_empty() {
        println!("no containers found");
    } else {
        println!(
            "{:<20} {:<24} {:<10} {:<12} {:<10} UUID",
            "WATCHER", "NAME", "KIND", "STATUS", "REGISTRY"
        );
        for row in &rows {
            println!(
                "{:<20} {:<24} {:<10} {:<12} {:<10} {}",
                row.watcher.as_str(),
                row.name,
                row.kind.to_string(),
                colorize_status(&row.status),
                row.registry.as_deref().unwrap_or("-"),
                row.uuid
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
