use std::collections::BTreeMap;
use std::path::PathBuf;
use taskgate_core::{Result, TaskDefinition};
use taskgate_task::TaskGate;

pub async fn execute(gate: &TaskGate, verbose: bool) -> Result<()> {
    let catalog = gate.tasks().await?;
    if catalog.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    let mut by_root: BTreeMap<&PathBuf, Vec<&TaskDefinition>> = BTreeMap::new();
    for definition in catalog.iter() {
        by_root
            .entry(&definition.identity.project_root)
            .or_default()
            .push(definition);
    }

    for (root, definitions) in by_root {
        println!("{}:", root.display());
        for definition in definitions {
            let marker = if definition.is_default { " (default)" } else { "" };
            println!("  {}{}", definition.script_path, marker);
            if verbose {
                if let Some(group) = &definition.group {
                    println!("      group: {group}");
                }
                if let Some(description) = &definition.description {
                    println!("      {description}");
                }
            }
        }
    }
    Ok(())
}
