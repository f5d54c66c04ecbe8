use colored::*;
use cpu::{Trace, TraceEntry};
use kernel::FatalKind;
use regex::Regex;
use serde::Serialize;

use crate::replay::thrown_code;
use crate::scenario::ScenarioProcess;

#[derive(Debug, Clone, Serialize)]
pub struct ReplayReport {
    pub scenario: String,
    pub processes: Vec<ProcessReport>,
    pub trace: Vec<TraceRow>,
    pub guest_logs: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessReport {
    pub name: String,
    pub pid: u64,
    pub exited: bool,
    pub fatal: Option<String>,
    pub debug_output: Vec<String>,
    /// Expectations that did not hold.
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TraceRow {
    pub core: usize,
    pub tag: String,
    pub values: Vec<String>,
    pub bytes: String,
}

impl From<TraceEntry> for TraceRow {
    fn from(entry: TraceEntry) -> Self {
        Self {
            core: entry.core,
            tag: entry.tag,
            values: entry.values.iter().map(|v| format!("{:#x}", v)).collect(),
            bytes: hex::encode(&entry.bytes),
        }
    }
}

impl ProcessReport {
    pub fn new(
        process: &ScenarioProcess,
        pid: u64,
        exited: bool,
        fatal: Option<FatalKind>,
        debug_output: Vec<String>,
        trace: &Trace,
    ) -> Self {
        let expect = &process.expect;
        let mut failures = Vec::new();
        if expect.exits && !exited {
            failures.push("did not exit before the timeout".to_string());
        }
        match (expect.fatal, &fatal) {
            (Some(code), Some(kind)) if thrown_code(kind) != Some(code) => {
                failures.push(format!("expected fatal {:#x}, got {}", code, kind));
            }
            (Some(code), None) => failures.push(format!("expected fatal {:#x}, got none", code)),
            (None, Some(kind)) if !expect.crashes => failures.push(format!("unexpected fatal: {}", kind)),
            (None, None) if expect.crashes => failures.push("expected a crash".to_string()),
            _ => {}
        }
        for (tag, expected) in &expect.records {
            let recorded: Vec<Vec<u64>> = trace.tagged(tag).into_iter().map(|e| e.values).collect();
            if &recorded != expected {
                failures.push(format!("{}: expected {:?}, recorded {:?}", tag, expected, recorded));
            }
        }
        Self {
            name: process.name.clone(),
            pid,
            exited,
            fatal: fatal.map(|kind| kind.to_string()),
            debug_output,
            failures,
        }
    }

    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }
}

impl ReplayReport {
    pub fn new(scenario: &str, processes: Vec<ProcessReport>, trace: Vec<TraceEntry>, guest_logs: Vec<String>) -> Self {
        Self {
            scenario: scenario.to_string(),
            processes,
            trace: trace.into_iter().map(TraceRow::from).collect(),
            guest_logs,
        }
    }

    pub fn passed(&self) -> bool {
        self.processes.iter().all(ProcessReport::passed)
    }

    /// Keeps only trace rows whose tag matches `filter`.
    pub fn retain_tags(&mut self, filter: &Regex) {
        self.trace.retain(|row| filter.is_match(&row.tag));
    }

    pub fn print(&self) {
        println!("{} {}", "Scenario:".bold(), self.scenario.yellow());
        println!();
        for process in &self.processes {
            let status = if process.passed() { "PASS".green() } else { "FAIL".red() };
            let outcome = match (&process.fatal, process.exited) {
                (Some(fatal), _) => fatal.red().to_string(),
                (None, true) => "exited".to_string(),
                (None, false) => "still running".yellow().to_string(),
            };
            println!("  {} {} (pid {}): {}", status, process.name.bold(), process.pid, outcome);
            for line in &process.debug_output {
                println!("      debug: {}", line.trim_end());
            }
            for failure in &process.failures {
                println!("      {}", failure.red());
            }
        }

        if !self.trace.is_empty() {
            println!();
            println!("  {}", "Trace:".bold());
            for row in &self.trace {
                print!("    core {} {:<20} {}", row.core, row.tag.cyan(), row.values.join(" "));
                if !row.bytes.is_empty() {
                    print!("  {}", row.bytes.dimmed());
                }
                println!();
            }
        }
        if !self.guest_logs.is_empty() {
            println!();
            println!("  {}", "Guest log:".bold());
            for line in &self.guest_logs {
                println!("    {}", line);
            }
        }
    }
}
