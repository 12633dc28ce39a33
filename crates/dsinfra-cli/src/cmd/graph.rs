use crate::inputs;
use crate::output::{print_json, print_section};
use dsinfra_core::deps;
use dsinfra_core::types::CloudName;
use std::path::Path;

pub fn run(config_path: &Path, cloud: Option<&str>, json: bool) -> anyhow::Result<()> {
    let config = inputs::load_config(config_path)?;
    let clouds: Vec<CloudName> = match cloud {
        Some(name) => vec![name.parse()?],
        None => CloudName::all()
            .iter()
            .copied()
            .filter(|c| config.datasets().any(|d| d.deploys_to(*c)))
            .collect(),
    };

    let datasets: Vec<serde_json::Value> = config
        .order()
        .iter()
        .filter_map(|name| config.dataset(name).ok())
        .map(|d| {
            serde_json::json!({
                "name": d.name,
                "clouds": d.clouds(),
                "depends_on": d.depends_on,
                "depends_on_readonly": d.depends_on_readonly,
            })
        })
        .collect();

    let bindings: Vec<(CloudName, _)> = clouds
        .iter()
        .flat_map(|&c| deps::resolve(&config, c).into_iter().map(move |b| (c, b)))
        .collect();

    if json {
        let value = serde_json::json!({
            "order": config.order(),
            "datasets": datasets,
            "bindings": bindings,
        });
        return print_json(&value);
    }

    let rows: Vec<Vec<String>> = config
        .order()
        .iter()
        .enumerate()
        .filter_map(|(i, name)| config.dataset(name).ok().map(|d| (i, d)))
        .map(|(i, d)| {
            let clouds: Vec<&str> = d.clouds().iter().map(|c| c.as_str()).collect();
            vec![
                (i + 1).to_string(),
                d.name.clone(),
                clouds.join(","),
                d.depends_on.join(","),
                d.depends_on_readonly.join(","),
            ]
        })
        .collect();
    print_section(
        "Build order",
        &["#", "DATASET", "CLOUDS", "DEPENDS ON", "READ-ONLY"],
        &rows,
    );

    let rows: Vec<Vec<String>> = bindings
        .iter()
        .map(|(c, b)| {
            vec![
                c.to_string(),
                b.principal.to_string(),
                b.role.to_string(),
                b.resource.to_string(),
            ]
        })
        .collect();
    print_section("Bindings", &["CLOUD", "PRINCIPAL", "ROLE", "RESOURCE"], &rows);

    Ok(())
}
