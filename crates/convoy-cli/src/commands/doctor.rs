use super::{store_path, tunnel_requirements, Globals, EXIT_FAILURE, EXIT_SUCCESS};
use convoy_core::{FleetConfig, InventoryLock};
use convoy_store::{ContainerRepository, InventoryStore, StoreLayout};

pub fn run(globals: &Globals) -> Result<u8, String> {
    let mut checks: Vec<Check> = Vec::new();
    let mut all_pass = true;

    let fleet = check_fleet(globals, &mut checks, &mut all_pass);
    check_prereqs(&fleet, &mut checks, &mut all_pass);
    check_vault(&fleet, &mut checks, &mut all_pass);

    let store_path = store_path(globals, &fleet);
    let layout = StoreLayout::new(&store_path);
    if layout.is_initialized() {
        checks.push(Check::pass(
            "store_exists",
            &format!("Store found at {}", store_path.display()),
        ));
        check_store(&layout, &mut checks, &mut all_pass);
    } else {
        checks.push(Check::info(
            "store_exists",
            &format!(
                "Store not initialized at {} (will be created on first poll)",
                store_path.display()
            ),
        ));
    }

    print_results(&checks, all_pass, globals.json)
}

fn check_fleet(globals: &Globals, checks: &mut Vec<Check>, all_pass: &mut bool) -> FleetConfig {
    let path = &globals.config;
    if !path.exists() {
        checks.push(Check::warn(
            "fleet_file",
            &format!("Fleet file {} not found", path.display()),
        ));
        return FleetConfig::default();
    }
    let fleet = match FleetConfig::load(path) {
        Ok(fleet) => fleet,
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("fleet_file", &format!("Fleet file invalid: {e}")));
            return FleetConfig::default();
        }
    };
    let enabled = fleet.devices.iter().filter(|d| d.device.enabled).count();
    checks.push(Check::pass(
        "fleet_file",
        &format!(
            "Fleet file valid: {} device(s), {enabled} enabled",
            fleet.devices.len()
        ),
    ));

    match fleet
        .vault()
        .and_then(|vault| fleet.registry_set(vault.as_ref()))
        .and_then(|set| set.current())
    {
        Ok(chain) => checks.push(Check::pass(
            "registries",
            &format!("Registry chain: {}", chain.names().join(", ")),
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail("registries", &format!("Registry chain invalid: {e}")));
        }
    }
    fleet
}

fn check_prereqs(fleet: &FleetConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let Some(password_auth) = tunnel_requirements(fleet) else {
        checks.push(Check::info("tunnel_prereqs", "No device is reached over ssh"));
        return;
    };
    let missing = convoy_runtime::check_tunnel_prereqs(password_auth);
    if missing.is_empty() {
        checks.push(Check::pass(
            "tunnel_prereqs",
            "ssh tunnel prerequisites satisfied",
        ));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "tunnel_prereqs",
            &convoy_runtime::format_missing(&missing),
        ));
    }
}

fn check_vault(fleet: &FleetConfig, checks: &mut Vec<Check>, all_pass: &mut bool) {
    let Some(program) = fleet.vault.command.first() else {
        checks.push(Check::info(
            "vault",
            "No vault command; secrets are read as plaintext",
        ));
        return;
    };
    if convoy_runtime::command_exists(program) {
        checks.push(Check::pass("vault", &format!("Vault command '{program}' found")));
    } else {
        *all_pass = false;
        checks.push(Check::fail(
            "vault",
            &format!("Vault command '{program}' not found in PATH"),
        ));
    }
}

fn check_store(layout: &StoreLayout, checks: &mut Vec<Check>, all_pass: &mut bool) {
    match layout.verify_version() {
        Ok(()) => checks.push(Check::pass("store_version", "Store format version valid")),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_version",
                &format!("Store version check failed: {e}"),
            ));
            return;
        }
    }

    let store = InventoryStore::new(layout.clone());
    match store.verify() {
        Ok(report) if report.failed.is_empty() => checks.push(Check::pass(
            "store_integrity",
            &format!("Inventory integrity OK ({} rows checked)", report.checked),
        )),
        Ok(report) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_integrity",
                &format!(
                    "{} of {} inventory rows corrupted",
                    report.failed.len(),
                    report.checked
                ),
            ));
        }
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_integrity",
                &format!("Integrity check failed: {e}"),
            ));
        }
    }

    match InventoryLock::try_claim(&layout.lock_file()) {
        Ok(Some(_)) => checks.push(Check::pass("store_lock", "Store lock is free")),
        Ok(None) => checks.push(Check::info(
            "store_lock",
            &match InventoryLock::holder(&layout.lock_file()) {
                Some(pid) => format!("Store lock is held by convoy process {pid}"),
                None => "Store lock is held (a convoy daemon is running)".to_owned(),
            },
        )),
        Err(e) => {
            *all_pass = false;
            checks.push(Check::fail(
                "store_lock",
                &format!("Cannot check store lock: {e}"),
            ));
        }
    }

    match store.list() {
        Ok(rows) => {
            let unreachable = rows
                .iter()
                .filter(|r| r.status == convoy_core::UNREACHABLE_STATUS)
                .count();
            checks.push(Check::info(
                "inventory",
                &format!("{} containers ({unreachable} unreachable)", rows.len()),
            ));
        }
        Err(e) => checks.push(Check::warn(
            "inventory",
            &format!("Cannot list inventory: {e}"),
        )),
    }
}

fn print_results(checks: &[Check], all_pass: bool, json_output: bool) -> Result<u8, String> {
    if json_output {
        let json = serde_json::json!({
            "healthy": all_pass,
            "checks": checks.iter().map(|c| serde_json::json!({
                "name": c.name,
                "status": c.status,
                "message": c.message,
            })).collect::<Vec<_>>(),
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).map_err(|e| e.to_string())?
        );
    } else {
        println!("Convoy Doctor\n");
        for check in checks {
            let icon = match check.status {
                "pass" => "✓",
                "fail" => "✗",
                "warn" => "⚠",
                _ => "ℹ",
            };
            println!("  {icon} {}", check.message);
        }
        println!();
        if all_pass {
            println!("All checks passed.");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    Ok(if all_pass { EXIT_SUCCESS } else { EXIT_FAILURE })
}

struct Check {
    name: &'static str,
    status: &'static str,
    message: String,
}

impl Check {
    fn new(name: &'static str, status: &'static str, message: &str) -> Self {
        Self {
            name,
            status,
            message: message.to_owned(),
        }
    }

    fn pass(name: &'static str, message: &str) -> Self {
        Self::new(name, "pass", message)
    }

    fn fail(name: &'static str, message: &str) -> Self {
        Self::new(name, "fail", message)
    }

    fn warn(name: &'static str, message: &str) -> Self {
        Self::new(name, "warn", message)
    }

    fn info(name: &'static str, message: &str) -> Self {
        Self::new(name, "info", message)
    }
}
