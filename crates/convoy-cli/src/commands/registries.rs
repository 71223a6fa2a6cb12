use super::{config_error, json_pretty, load_fleet, Globals, EXIT_FAILURE, EXIT_SUCCESS};
use convoy_remote::RegistryChain;

struct Row {
    image: String,
    outcome: Result<(String, String), String>,
    login: Option<Result<(), String>>,
}

pub fn run(globals: &Globals, images: &[String], login: bool) -> Result<u8, String> {
    let fleet = load_fleet(&globals.config, false)?;
    let vault = fleet.vault().map_err(config_error)?;
    let set = fleet.registry_set(vault.as_ref()).map_err(config_error)?;
    let chain = set.current().map_err(|e| e.to_string())?;

    let rows: Vec<Row> = images.iter().map(|image| classify(&chain, image, login)).collect();
    let failed = rows
        .iter()
        .any(|r| r.outcome.is_err() || matches!(r.login, Some(Err(_))));

    if globals.json {
        let providers: Vec<_> = chain
            .names()
            .into_iter()
            .filter_map(|name| chain.get(name))
            .map(|p| {
                serde_json::json!({
                    "name": p.name(),
                    "kind": p.kind(),
                    "credentials": p.has_credentials(),
                })
            })
            .collect();
        let images: Vec<_> = rows
            .iter()
            .map(|r| {
                let mut entry = match &r.outcome {
                    Ok((provider, normalized)) => serde_json::json!({
                        "image": r.image,
                        "provider": provider,
                        "normalized": normalized,
                    }),
                    Err(e) => serde_json::json!({"image": r.image, "error": e}),
                };
                if let Some(login) = &r.login {
                    entry["login"] = match login {
                        Ok(()) => serde_json::json!("ok"),
                        Err(e) => serde_json::json!(e),
                    };
                }
                entry
            })
            .collect();
        let payload = serde_json::json!({
            "registries": providers,
            "images": images,
        });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("registries (evaluation order):");
        for name in chain.names() {
            if let Some(p) = chain.get(name) {
                let creds = if p.has_credentials() { "credentials" } else { "anonymous" };
                println!("  {:<16} {:<8} {creds}", p.name(), p.kind().to_string());
            }
        }
        if !rows.is_empty() {
            println!();
        }
        for row in &rows {
            match &row.outcome {
                Ok((provider, normalized)) => {
                    println!("  {:<40} {provider:<16} {normalized}", row.image);
                }
                Err(e) => println!("  {:<40} error: {e}", row.image),
            }
            match &row.login {
                Some(Ok(())) => println!("    login ok"),
                Some(Err(e)) => println!("    login failed: {e}"),
                None => {}
            }
        }
    }

    Ok(if failed { EXIT_FAILURE } else { EXIT_SUCCESS })
}

fn classify(chain: &RegistryChain, image: &str, login: bool) -> Row {
    match chain.classify(image) {
        Ok(c) => Row {
            image: image.to_owned(),
            outcome: Ok((c.provider, c.normalized)),
            login: login.then(|| {
                chain
                    .authenticate(image)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        },
        Err(e) => Row {
            image: image.to_owned(),
            outcome: Err(e.to_string()),
            login: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn classification_without_login_is_offline() {
        let chain = RegistryChain::hub_only(Duration::from_secs(1));
        let row = classify(&chain, "nginx:1.25", false);
        let (provider, _) = row.outcome.unwrap();
        assert_eq!(provider, "hub");
        assert!(row.login.is_none());
    }

    #[test]
    fn unparsable_reference_is_reported() {
        let chain = RegistryChain::hub_only(Duration::from_secs(1));
        let row = classify(&chain, "", false);
        assert!(row.outcome.is_err());
    }
}
