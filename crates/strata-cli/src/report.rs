use std::fmt::Write;

use strata_db::{
    Drift, HistoryRecord, RollbackReport, RunReport, StatusReport, short_checksum,
};

const WIDTH: usize = 72;

/// Boxed table: a titled top border, one row per line, a closing border.
fn boxed(title: &str, lines: &[String]) -> String {
    let inner = WIDTH - 4; // "│ " + " │"
    let title_dashes = WIDTH.saturating_sub(title.chars().count() + 7); // "╭─── " + " " + "╮"
    let mut out = String::new();
    let _ = writeln!(out, "╭─── {title} {}╮", "─".repeat(title_dashes));
    for line in lines {
        let clipped: String = line.chars().take(inner).collect();
        let _ = writeln!(out, "│ {clipped:<inner$} │");
    }
    let _ = writeln!(out, "╰{}╯", "─".repeat(WIDTH - 2));
    out
}

pub fn render_status(status: &StatusReport) -> String {
    let mut lines = vec![format!(
        "{:<16}{:<28}{:<13}{}",
        "VERSION", "NAME", "STATE", "APPLIED AT"
    )];
    lines.push("─".repeat(WIDTH - 4));

    for entry in &status.entries {
        let applied_at = entry
            .applied_at
            .map(|at| at.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        let marker = if entry.drifted { " *" } else { "" };
        lines.push(format!(
            "{:<16}{:<28}{:<13}{applied_at}{marker}",
            entry.version,
            entry.name,
            entry.state.label()
        ));
    }

    if status.entries.is_empty() {
        lines.push("no migrations found".to_string());
    }

    lines.push(String::new());
    lines.push(format!(
        "{} applied, {} pending ({} failed, {} rolled back)",
        status.applied_count, status.pending_count, status.failed_count, status.rolled_back_count
    ));
    if !status.drift.is_empty() {
        lines.push(format!(
            "* {} applied migration(s) changed on disk; run `strata verify`",
            status.drift.len()
        ));
    }
    for orphan in &status.orphaned {
        lines.push(format!(
            "! {} ({}) is in history but its file is missing",
            orphan.version, orphan.name
        ));
    }

    boxed("strata status", &lines)
}

pub fn print_status(status: &StatusReport) {
    print!("{}", render_status(status));
}

pub fn render_run(report: &RunReport) -> String {
    let mut out = String::new();

    if report.dry_run {
        if report.planned.is_empty() {
            let _ = writeln!(out, "Dry run: nothing to apply.");
        }
        for planned in &report.planned {
            let mode = if planned.transactional {
                ""
            } else {
                " [no transaction]"
            };
            let _ = writeln!(out, "-- {}_{}{mode}", planned.version, planned.name);
            let _ = writeln!(out, "{}", planned.script.trim_end());
            let _ = writeln!(out);
        }
    } else if report.applied.is_empty() {
        let _ = writeln!(out, "Database is up to date ({} already applied).", report.skipped);
    } else {
        for applied in &report.applied {
            let _ = writeln!(
                out,
                "  applied {}_{} in {} ms",
                applied.version, applied.name, applied.execution_time_ms
            );
        }
        let _ = writeln!(
            out,
            "Applied {} migration(s), {} already applied.",
            report.applied.len(),
            report.skipped
        );
    }

    if !report.held_back.is_empty() {
        let _ = writeln!(
            out,
            "Held back (rolled back; use --force to re-apply): {}",
            report.held_back.join(", ")
        );
    }
    if !report.drift.is_empty() {
        out.push_str(&render_drift(&report.drift));
    }
    out
}

pub fn print_run(report: &RunReport) {
    print!("{}", render_run(report));
}

pub fn render_drift(drift: &[Drift]) -> String {
    if drift.is_empty() {
        return "All applied migrations match their files.\n".to_string();
    }
    let mut out = format!("{} migration(s) changed after being applied:\n", drift.len());
    for d in drift {
        let _ = writeln!(
            out,
            "  {}_{}  recorded {}  current {}",
            d.version,
            d.name,
            short_checksum(&d.recorded_checksum),
            short_checksum(&d.current_checksum)
        );
    }
    out
}

pub fn print_drift(drift: &[Drift]) {
    print!("{}", render_drift(drift));
}

pub fn print_rollback_plan(selected: &[HistoryRecord]) {
    println!("The following migrations will be marked ROLLED_BACK:");
    for record in selected {
        println!("  {}_{}", record.version, record.name);
    }
}

pub fn print_rollback(report: &RollbackReport) {
    if report.cancelled {
        println!("Rollback cancelled; nothing changed.");
    } else if report.rolled_back.is_empty() {
        println!("Nothing to roll back.");
    } else {
        println!(
            "Marked {} migration(s) rolled back: {}",
            report.rolled_back.len(),
            report.rolled_back.join(", ")
        );
        println!("The database schema was not changed. Reverse it by hand if needed.");
    }
}
