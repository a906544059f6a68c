use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    DryRunPlan, PipelineSummary, ProgressEvent, ProgressSink, ResetResult, StatusReport,
    ValidationReport,
};
use crate::fastq::FastqCheck;
use crate::sample::SampleState;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_summary(result: &PipelineSummary) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_plan(result: &DryRunPlan) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_reset(result: &ResetResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_validation(result: &ValidationReport) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Prints phase events to stderr, one line each.
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn event(&self, event: ProgressEvent) {
        let elapsed = event
            .elapsed
            .map(|value| format!("[{:>6.1}s] ", value.as_secs_f64()))
            .unwrap_or_default();
        eprintln!("{CYAN}{elapsed}{}{RESET}", event.message);
    }
}

pub fn print_run_summary(result: &PipelineSummary) {
    println!("{CYAN}KIRA-SCPREP summary{RESET} ({})", result.base_dir);
    let counts = result
        .stage_counts
        .iter()
        .map(|entry| format!("{}={}", entry.stage, entry.count))
        .collect::<Vec<_>>()
        .join("  ");
    println!("   markers: {counts}");

    let acquired = result
        .runs
        .iter()
        .filter(|run| run.outcome.is_acquired())
        .count();
    println!("{GREEN}Runs acquired this pass: {acquired}{RESET}");
    if !result.run_failures.is_empty() {
        println!("{RED}Run failures: {}{RESET}", result.run_failures.len());
        for failure in &result.run_failures {
            println!("{RED}   {} ({}): {}{RESET}", failure.run, failure.sample, failure.message);
        }
    }

    for report in &result.samples {
        match &report.state {
            SampleState::Complete { inputs_retained } => {
                let inputs = if *inputs_retained {
                    "inputs kept"
                } else {
                    "inputs deleted"
                };
                println!("{GREEN}   {} complete, {inputs}{RESET}", report.sample);
            }
            SampleState::Blocked { at, reason } => {
                println!(
                    "{YELLOW}   {} blocked at {at:?}: {reason}{RESET}",
                    report.sample
                );
            }
        }
    }
    if result.skipped_manifest_rows > 0 {
        println!(
            "{YELLOW}Skipped manifest rows: {}{RESET}",
            result.skipped_manifest_rows
        );
    }
}

pub fn print_status(result: &StatusReport) {
    println!("{CYAN}KIRA-SCPREP status{RESET} ({})", result.base_dir);
    for entry in &result.stage_counts {
        println!("   {:<24} {}", entry.stage.as_str(), entry.count);
    }
    for sample in &result.state.samples {
        let color = if sample.ready_for_quantification() {
            GREEN
        } else {
            YELLOW
        };
        let stages = sample
            .stages_done
            .iter()
            .map(|stage| stage.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "{color}   {} runs {}/{}{}{RESET}",
            sample.sample,
            sample.acquired_runs,
            sample.expected_runs,
            if stages.is_empty() {
                String::new()
            } else {
                format!("  [{stages}]")
            }
        );
    }
}

pub fn print_plan(result: &DryRunPlan) {
    println!("{CYAN}KIRA-SCPREP dry run{RESET}");
    println!("   runs to acquire: {}", result.acquisitions.len());
    for item in &result.acquisitions {
        println!("      {} -> {} lane {}", item.run, item.sample, item.lane);
    }
    for sample in &result.samples {
        let next = sample
            .next_stage
            .map(|stage| stage.as_str())
            .unwrap_or("nothing");
        println!(
            "   {}: {} runs pending, next {}",
            sample.sample, sample.pending_runs, next
        );
    }
}

pub fn print_reset(result: &ResetResult) {
    println!(
        "{YELLOW}Removed {} {} marker(s){}{RESET}",
        result.removed,
        result.stage,
        result
            .entity
            .as_deref()
            .map(|entity| format!(" for {entity}"))
            .unwrap_or_default()
    );
}

pub fn print_validation(result: &ValidationReport) {
    if let Some(repair) = &result.repaired {
        println!(
            "{YELLOW}{}: repaired ({} headers, {} separators){RESET}",
            result.path, repair.headers_fixed, repair.separators_fixed
        );
    }
    match &result.check {
        FastqCheck::Valid { records } => {
            println!("{GREEN}{}: valid ({records} records checked){RESET}", result.path)
        }
        FastqCheck::Invalid { line, reason } => {
            println!("{RED}{}: invalid at line {line}: {reason}{RESET}", result.path)
        }
    }
}
