//! Terminal rendering for run reports and queries.

use console::style;

use crate::orchestrator::{ExecutionReport, PhaseStatus};
use crate::reclaim::OrphanCandidate;
use crate::synclog::{SyncStatus, TransitionRecord};

/// Print the outcome of a run: per-phase lines, then the summary and any
/// required external actions.
pub fn print_report(report: &ExecutionReport) {
    println!(
        "{} {} {}",
        style("cadence").bold(),
        style(&report.branch).cyan(),
        style(format!("({})", report.context_id)).dim()
    );

    for phase in &report.phases {
        let mark = match phase.status.as_str() {
            "completed" => style("✓").green(),
            "failed" => style("✗").red(),
            _ => style("·").dim(),
        };
        match &phase.detail {
            Some(detail) => println!("  {mark} {:<10} {}", phase.name, style(detail).dim()),
            None => println!("  {mark} {}", phase.name),
        }
    }

    if report.paused {
        println!("\n{} {}", style("paused").yellow().bold(), report.summary);
        for action in &report.required_actions {
            println!("  {} {}", style("→").yellow(), action);
        }
        println!(
            "\n{}",
            style("run 'cadence continue' once the reviews above are approved").dim()
        );
    } else if report.failed {
        println!("\n{} {}", style("failed").red().bold(), report.summary);
        println!(
            "{}",
            style("fix the failure and re-run 'cadence run' to retry the phase").dim()
        );
    } else {
        println!("\n{} {}", style("done").green().bold(), report.summary);
    }
}

/// Print the human-readable phase query.
pub fn print_status(status: &PhaseStatus) {
    println!(
        "{} phase {} ({})",
        style(&status.context_id).dim(),
        style(status.phase_index).bold(),
        status.phase_name
    );
    match &status.last_sync_time {
        Some(t) => println!("last sync: {}", t.to_rfc3339()),
        None => println!("last sync: never"),
    }
    println!("next: {}", style(&status.recommended_action).cyan());
}

/// Print log history, newest-first.
pub fn print_history(records: &[TransitionRecord]) {
    if records.is_empty() {
        println!("no records");
        return;
    }
    for record in records {
        let mark = match record.status {
            SyncStatus::Completed => style("✓").green(),
            SyncStatus::Failed => style("✗").red(),
            SyncStatus::Pending => style("·").dim(),
        };
        println!(
            "{mark} {} {:<10} {} {} {}",
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.phase,
            style(record.context_id.as_deref().unwrap_or("primary")).dim(),
            record.source_ref.as_deref().unwrap_or("-"),
            style(&record.sync_id[..8]).dim()
        );
    }
}

/// Print orphan candidates found by the reclaimer.
pub fn print_orphans(orphans: &[OrphanCandidate]) {
    if orphans.is_empty() {
        println!("no orphaned state stores");
        return;
    }
    for orphan in orphans {
        println!(
            "{} {} {}",
            style("orphan").yellow(),
            orphan.store_path.display(),
            style(format!(
                "(last context {})",
                orphan.last_seen_context_id.as_deref().unwrap_or("unknown")
            ))
            .dim()
        );
    }
    println!(
        "\n{}",
        style("run 'cadence reclaim <path>' to delete one").dim()
    );
}

/// Interactive confirmation before deleting a store.
pub fn confirm_reclaim(candidate: &OrphanCandidate) -> anyhow::Result<bool> {
    let confirmed = dialoguer::Confirm::new()
        .with_prompt(format!(
            "Delete {} and its recorded state?",
            candidate.store_path.display()
        ))
        .default(false)
        .interact()?;
    Ok(confirmed)
}
