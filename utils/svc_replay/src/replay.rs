use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use cpu::{ScriptBook, ScriptedExecutorFactory, Trace};
use kernel::{FatalKind, KernelEvent};
use memory::AddressSpaceLayout;
use system::{System, SystemConfig};

use crate::report::{ProcessReport, ReplayReport};
use crate::scenario::{Scenario, PROCESS_STRIDE};

/// Runs every process of `scenario` on a fresh system and collects what
/// happened.
pub fn replay(scenario: &Scenario, config: SystemConfig, timeout: Duration) -> Result<ReplayReport> {
    let book = ScriptBook::new();
    let trace = Trace::new();
    let factory = ScriptedExecutorFactory::new(book.clone(), trace.clone());
    let mut system = System::new(config, Arc::new(factory)).context("cannot build the system")?;

    let mut images = Vec::with_capacity(scenario.processes.len());
    for (i, process) in scenario.processes.iter().enumerate() {
        let base = AddressSpaceLayout::CODE_START + i as u64 * PROCESS_STRIDE;
        images.push(process.image(base, &book)?);
    }
    system.start().context("cannot start the system")?;
    let pids = images
        .iter()
        .map(|image| system.load_program(image))
        .collect::<Result<Vec<u64>, _>>()
        .context("cannot load a scenario process")?;

    let deadline = Instant::now() + timeout;
    let exited: Vec<bool> = pids
        .iter()
        .map(|&pid| {
            let left = deadline.saturating_duration_since(Instant::now());
            system.run_until_exit(pid, left).is_ok()
        })
        .collect();
    let events = system.events(Duration::from_millis(50));
    system.shutdown();

    let processes = scenario
        .processes
        .iter()
        .zip(pids.iter().zip(exited))
        .map(|(process, (&pid, exited))| {
            let fatal = events.iter().find_map(|event| match event {
                KernelEvent::Fatal { pid: p, kind, .. } if *p == pid => Some(kind.clone()),
                _ => None,
            });
            let debug_output = events
                .iter()
                .filter_map(|event| match event {
                    KernelEvent::DebugOutput { pid: p, text } if *p == pid => Some(text.clone()),
                    _ => None,
                })
                .collect();
            ProcessReport::new(process, pid, exited, fatal, debug_output, &trace)
        })
        .collect();

    let guest_logs = system
        .services()
        .log
        .entries()
        .into_iter()
        .map(|entry| format!("[{}] {}", entry.pid, entry.message))
        .collect();

    Ok(ReplayReport::new(&scenario.name, processes, trace.entries(), guest_logs))
}

/// Raw result code carried by a fatal reported through `fatal:u`.
pub fn thrown_code(kind: &FatalKind) -> Option<u32> {
    match kind {
        FatalKind::Service(rc) => Some(rc.raw()),
        _ => None,
    }
}
