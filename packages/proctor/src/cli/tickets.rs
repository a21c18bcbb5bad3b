//! `proctor tickets`: the file-backed recovery tickets in `<data-dir>/tickets`.

use anyhow::{Context, Result};
use proctor_sync::{
    FileKeyValueStore, NoticeBus, RecoveryCoordinator, RecoveryTicket, SyncMetrics,
};
use std::sync::Arc;

use crate::config::ProctorConfig;

async fn coordinator(config: &ProctorConfig) -> Result<RecoveryCoordinator> {
    let dir = &config.tickets_dir;
    let store = FileKeyValueStore::open(dir)
        .await
        .with_context(|| format!("Failed to open ticket store at {}", dir.display()))?;
    Ok(RecoveryCoordinator::new(
        Arc::new(store),
        config.sync().recovery,
        NoticeBus::new(),
        Arc::new(SyncMetrics::new()),
    ))
}

fn describe(ticket: &RecoveryTicket) -> String {
    let status = if ticket.terminal {
        "terminal"
    } else {
        "retrying"
    };
    let last = ticket
        .last_attempt_at
        .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    format!(
        "{:<36}  {:>2}/{:<2}  {:<8}  last attempt {}",
        ticket.instance_id, ticket.attempt_count, ticket.max_attempts, status, last
    )
}

pub async fn list_command(config: &ProctorConfig, json: bool) -> Result<()> {
    let tickets = coordinator(config).await?.tickets().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tickets)?);
        return Ok(());
    }

    if tickets.is_empty() {
        println!("No recovery tickets.");
        return Ok(());
    }
    for ticket in &tickets {
        println!("{}", describe(ticket));
    }
    Ok(())
}

pub async fn show_command(config: &ProctorConfig, instance_id: &str) -> Result<()> {
    let ticket = coordinator(config)
        .await?
        .load_ticket(instance_id)
        .await?
        .with_context(|| format!("No ticket for {}", instance_id))?;
    println!("{}", serde_json::to_string_pretty(&ticket)?);
    Ok(())
}

pub async fn clear_command(config: &ProctorConfig, instance_id: &str) -> Result<()> {
    let coordinator = coordinator(config).await?;
    if coordinator.load_ticket(instance_id).await?.is_none() {
        println!("No ticket for {}", instance_id);
        return Ok(());
    }
    coordinator.clear_ticket(instance_id).await?;
    println!("Cleared ticket for {}", instance_id);
    Ok(())
}

pub async fn prune_command(config: &ProctorConfig) -> Result<()> {
    let pruned = coordinator(config).await?.prune_expired().await?;
    println!("Pruned {} expired ticket(s)", pruned);
    Ok(())
}
