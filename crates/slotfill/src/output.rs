//! Human-readable and JSON rendering for command results.

use std::fmt::Write as _;

use serde::Serialize;

use slotfill_core::gap::{SlotPeriod, SlotStatus};
use slotfill_core::inventory::UnavailableArea;
use slotfill_core::report::{RunReport, ScanReport, SlotOutcome};
use slotfill_core::verify::{CoverageResult, SlotInspection, VerifySummary};

pub fn json<T: Serialize>(value: &T) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

fn ts(value: Option<chrono::DateTime<chrono::Utc>>) -> String {
    value.map_or_else(|| "-".to_string(), |t| t.to_rfc3339())
}

fn write_unavailable(out: &mut String, areas: &[UnavailableArea]) {
    for area in areas {
        let _ = writeln!(
            out,
            "Area {} unavailable, its copies were not considered: {}",
            area.area, area.reason
        );
    }
}

fn write_periods(out: &mut String, label: &str, periods: &[SlotPeriod]) {
    if periods.is_empty() {
        return;
    }
    let _ = writeln!(out, "{label} ({}):", periods.len());
    for period in periods {
        let _ = writeln!(
            out,
            "  {} .. {} ({} slots)",
            period.first_key, period.last_key, period.slots
        );
    }
}

pub fn render_scan(report: &ScanReport) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Scanned {} slots ({} listing calls): {} complete, {} incomplete, {} missing",
        report.total_slots,
        report.listing_calls,
        report.count(SlotStatus::Complete),
        report.count(SlotStatus::Incomplete),
        report.count(SlotStatus::Missing),
    );
    write_unavailable(&mut out, &report.unavailable_areas);
    let gaps = report.gaps();
    if gaps.is_empty() {
        let _ = writeln!(out, "No gaps.");
        return out;
    }
    for gap in gaps {
        let evidence: Vec<String> = gap
            .areas
            .iter()
            .map(|a| match a.line_count {
                Some(lines) => format!("{}={lines} lines", a.area),
                None => format!("{}=absent", a.area),
            })
            .collect();
        let _ = writeln!(
            out,
            "  {:<16} {:<10} {}",
            gap.slot_key,
            gap.status,
            evidence.join(", ")
        );
    }
    write_periods(&mut out, "Gap periods", &report.gap_periods());
    out
}

pub fn render_run(report: &RunReport) -> String {
    let mut out = String::new();
    let s = &report.summary;
    write_unavailable(&mut out, &report.unavailable_areas);
    if report.dry_run {
        let _ = writeln!(
            out,
            "Dry run: {} of {} slots would be complemented",
            s.planned, s.total_slots
        );
        for slot in &report.slots {
            let _ = writeln!(out, "  {:<16} {}", slot.slot_key, slot.pre_status);
        }
        return out;
    }

    for slot in &report.slots {
        let mut line = format!("  {:<16} {:<9}", slot.slot_key, outcome_label(slot.outcome));
        if let Some(fetch) = &slot.fetch {
            let stop = fetch.stop.map_or_else(|| "-".to_string(), |r| r.to_string());
            let _ = write!(
                line,
                " fetched={} pages={} stop={stop}",
                fetch.records, fetch.pages
            );
        }
        if let Some(merge) = &slot.merge {
            let _ = write!(line, " new={} total={}", merge.new_records, merge.total);
        }
        if let Some(coverage) = &slot.coverage {
            let _ = write!(line, " verify={}", coverage.verdict());
        }
        if let Some(error) = &slot.error {
            let _ = write!(line, " error=\"{error}\"");
        }
        let _ = writeln!(out, "{line}");
    }
    let _ = writeln!(
        out,
        "Targeted {} of {} slots: {} completed, {} partial, {} failed, {} skipped; {} new records",
        s.targeted, s.total_slots, s.completed, s.partial, s.failed, s.skipped, s.new_records
    );
    write_periods(&mut out, "Periods to re-run", &s.rerun_periods);
    if report.cancelled {
        let _ = writeln!(out, "Run was cancelled before finishing.");
    }
    if let Some(error) = &report.verification_error {
        let _ = writeln!(out, "Verification could not run: {error}");
    }
    out
}

const fn outcome_label(outcome: SlotOutcome) -> &'static str {
    match outcome {
        SlotOutcome::Completed => "completed",
        SlotOutcome::Partial => "partial",
        SlotOutcome::Failed => "failed",
        SlotOutcome::Skipped => "skipped",
        SlotOutcome::Planned => "planned",
    }
}

pub fn render_verify(results: &[CoverageResult]) -> String {
    let mut out = String::new();
    for r in results {
        let source = if r.covered_by_source { " (source)" } else { "" };
        let _ = writeln!(
            out,
            "  {:<16} {:<8} notes={} oldest={} early={}{source}",
            r.slot_key,
            r.verdict(),
            r.note_count,
            ts(r.oldest_ts),
            r.has_early_coverage,
        );
    }
    let summary = VerifySummary::from_results(results);
    let _ = writeln!(
        out,
        "Verified {} slots: {} ok, {} warning, {} failed",
        results.len(),
        summary.ok,
        summary.warning,
        summary.failed
    );
    out
}

pub fn render_inspection(inspection: &SlotInspection) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Slot {} [{} .. {})",
        inspection.slot_key,
        inspection.slot_start.to_rfc3339(),
        inspection.slot_end.to_rfc3339()
    );
    for area in &inspection.areas {
        if area.exists {
            let _ = writeln!(
                out,
                "  {:<16} {} lines ({} invalid), {} ids, {} duplicated, {} .. {}",
                area.area,
                area.lines,
                area.invalid_lines,
                area.unique_ids,
                area.duplicate_ids,
                ts(area.oldest),
                ts(area.newest),
            );
        } else {
            let _ = writeln!(out, "  {:<16} absent ({})", area.area, area.object_key);
        }
    }
    let _ = writeln!(
        out,
        "Total: {} lines, {} unique ids, {} shared across areas",
        inspection.total_lines, inspection.total_unique_ids, inspection.cross_area_duplicates
    );
    let _ = writeln!(
        out,
        "Covers start: {}, covers end: {}",
        inspection.covers_start, inspection.covers_end
    );
    out
}
