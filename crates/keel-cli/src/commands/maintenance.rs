use keel_core::KeelConfig;

use super::open_store;

pub fn reap(config: &KeelConfig, index: u64) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let reaped = store.reap_tombstones(index)?;
    println!("Reaped {reaped} tombstones at or below index {index}");
    Ok(())
}

pub fn indexes(config: &KeelConfig) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let entries = store.indexes()?;
    if entries.is_empty() {
        println!("No writes recorded");
        return Ok(());
    }
    let width = entries.iter().map(|e| e.key.len()).max().unwrap_or(0);
    for entry in &entries {
        println!("{:<width$}  {}", entry.key, entry.value);
    }
    Ok(())
}
