//! Plugin management commands: scan, list, upload, inspect, refresh,
//! remove, enable and disable.

use std::path::Path;

use anyhow::{Context, Result};
use keel_config::Config;
use keel_plugins::{PackageLocator, PluginId, PluginRecord, RefreshOutcome, ScanReport};

use crate::config_bridge;
use crate::theme::Theme;

pub(crate) async fn scan(config: &Config) -> Result<()> {
    let service = config_bridge::loader_service(config)?;
    let report = service.scan().await.context("scan failed")?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &ScanReport) {
    println!("{}", Theme::header("Scan report"));
    println!("{}", Theme::separator());
    for id in &report.added {
        println!("  {}", Theme::success(&format!("added {id}")));
    }
    for record in &report.removed {
        println!(
            "  {}",
            Theme::warning(&format!("removed {} ({})", record.id(), record.storage_key))
        );
    }
    for filename in &report.pruned {
        println!("  {}", Theme::dimmed(&format!("pruned {filename}")));
    }
    for key in &report.skipped {
        println!("  {}", Theme::info(&format!("skipped {key}")));
    }
    for (key, error) in &report.failed {
        println!("  {}", Theme::error(&format!("{key}: {error}")));
    }
    if report.is_unchanged() && report.pruned.is_empty() && report.failed.is_empty() {
        println!("  {}", Theme::info("Already up to date"));
    }
}

pub(crate) async fn list(config: &Config, enabled_only: bool) -> Result<()> {
    let info = config_bridge::read_only_info_store(config)?;
    let mut records = info.list().await.context("failed to list plugins")?;
    if enabled_only {
        records.retain(|r| r.enabled);
    }

    if records.is_empty() {
        println!("{}", Theme::info("No plugins known"));
        return Ok(());
    }

    println!("{}", Theme::header("Known Plugins"));
    println!("  {:<20} {:<10} {:<10} STORAGE KEY", "ID", "VERSION", "STATE");
    println!("{}", Theme::separator());
    for record in &records {
        print_record_row(record);
    }
    println!("\n{}", Theme::dimmed(&format!("{} plugin(s)", records.len())));
    Ok(())
}

fn print_record_row(record: &PluginRecord) {
    println!(
        "  {:<20} {:<10} {:<10} {}",
        record.id(),
        record.metadata.version.as_deref().unwrap_or("-"),
        Theme::state(record.enabled),
        record.storage_key
    );
}

pub(crate) async fn upload(config: &Config, file: &Path, enable: bool) -> Result<()> {
    let reader = std::fs::File::open(file)
        .with_context(|| format!("failed to open {}", file.display()))?;
    let service = config_bridge::loader_service(config)?;
    let record = service
        .upload(std::io::BufReader::new(reader), enable)
        .await
        .with_context(|| format!("failed to upload {}", file.display()))?;

    println!(
        "{}",
        Theme::success(&format!(
            "Uploaded {} as {} ({})",
            record.id(),
            record.storage_key,
            if record.enabled { "enabled" } else { "disabled" }
        ))
    );
    if enable {
        service.shutdown().await;
    }
    Ok(())
}

pub(crate) async fn inspect(locator: &str) -> Result<()> {
    let locator: PackageLocator = locator.parse()?;
    let display = locator.to_string();
    let metadata = tokio::task::spawn_blocking(move || keel_plugins::read_metadata(&locator))
        .await?
        .with_context(|| format!("failed to read {display}"))?;

    println!("{}", Theme::header(&metadata.name));
    println!("{}", Theme::separator());
    println!("  {:<12} {}", "id", metadata.id);
    println!(
        "  {:<12} {}",
        "version",
        metadata.version.as_deref().unwrap_or("-")
    );
    println!("  {:<12} {}", "entry point", metadata.entry_point);
    if let Some(description) = &metadata.description {
        println!("  {:<12} {}", "description", description);
    }
    println!("  {:<12} {}", "filename", metadata.filename()?);
    Ok(())
}

pub(crate) async fn refresh(config: &Config, path: &str) -> Result<()> {
    let service = config_bridge::loader_service(config)?;
    let outcome = service
        .refresh(path)
        .await
        .with_context(|| format!("failed to refresh {path}"))?;
    let line = match outcome {
        RefreshOutcome::Added(id) => Theme::success(&format!("Added {id} from {path}")),
        RefreshOutcome::Removed(record) => {
            Theme::warning(&format!("Removed {} ({path} is gone)", record.id()))
        },
        RefreshOutcome::Unchanged => Theme::info(&format!("{path} is up to date")),
    };
    println!("{line}");
    Ok(())
}

pub(crate) async fn remove(config: &Config, id: &str) -> Result<()> {
    let id = PluginId::new(id)?;
    let service = config_bridge::loader_service(config)?;
    let record = service
        .remove(&id)
        .await
        .with_context(|| format!("failed to remove {id}"))?;
    println!(
        "{}",
        Theme::success(&format!("Removed {} ({})", record.id(), record.storage_key))
    );
    Ok(())
}

pub(crate) async fn enable(config: &Config, id: &str) -> Result<()> {
    let id = PluginId::new(id)?;
    let service = config_bridge::loader_service(config)?;
    let active = service
        .enable(&id)
        .await
        .with_context(|| format!("failed to enable {id}"))?;

    let descriptor = active.descriptor();
    println!("{}", Theme::success(&format!("Enabled {id}")));
    println!("{}", Theme::header(&descriptor.name));
    println!("{}", Theme::separator());
    if let Some(description) = &descriptor.description {
        println!("  {description}");
    }
    for message in &descriptor.system_messages {
        println!("  {}", Theme::dimmed(message));
    }
    for tool in &descriptor.tools {
        let schema = serde_json::to_string(&tool.schema().to_json_schema())?;
        println!("  {} {}", tool.name(), Theme::dimmed(&schema));
    }

    // The instance only lived for this command; the flag stays enabled so a
    // running host restores it.
    service.shutdown().await;
    Ok(())
}

pub(crate) async fn disable(config: &Config, id: &str) -> Result<()> {
    let id = PluginId::new(id)?;
    let service = config_bridge::loader_service(config)?;
    service
        .disable(&id)
        .await
        .with_context(|| format!("failed to disable {id}"))?;
    println!("{}", Theme::success(&format!("Disabled {id}")));
    Ok(())
}
