use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use cpu::scripted::OP_SIZE;
use cpu::{Op, ScriptBook};
use serde::Deserialize;
use system::{ProgramImage, Segment, SystemConfig};
use types::{align_up, MemoryPermission, VAddr, PAGE_SIZE};

/// Distance between the code of consecutive scenario processes; the
/// script book is keyed by address alone.
pub const PROCESS_STRIDE: u64 = 0x100_0000;

/// A replay scenario as read from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    /// Overrides defaults and any `--config` file when present.
    #[serde(default)]
    pub config: Option<SystemConfig>,
    pub processes: Vec<ScenarioProcess>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioProcess {
    pub name: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Hex bytes mapped read-write right after the code.
    #[serde(default)]
    pub data: Option<String>,
    pub scripts: Vec<ScenarioScript>,
    #[serde(default)]
    pub expect: Expectation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScenarioScript {
    /// Byte offset from the process's code base. Offset 0 is the entry.
    pub offset: u64,
    pub ops: Vec<Op>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Expectation {
    pub exits: bool,
    /// Raw result code the process should die with through `fatal:u`.
    pub fatal: Option<u32>,
    /// Any fatal error is expected, fault or thrown.
    pub crashes: bool,
    /// Exact values each tag should record, in order.
    pub records: BTreeMap<String, Vec<Vec<u64>>>,
}

impl Default for Expectation {
    fn default() -> Self {
        Self {
            exits: true,
            fatal: None,
            crashes: false,
            records: BTreeMap::new(),
        }
    }
}

fn default_priority() -> u32 {
    44
}

pub fn load(path: &Path) -> Result<Scenario> {
    let text = fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    let scenario: Scenario =
        serde_json::from_str(&text).with_context(|| format!("{} is not a valid scenario", path.display()))?;
    if scenario.processes.is_empty() {
        bail!("scenario {} has no processes", scenario.name);
    }
    Ok(scenario)
}

impl ScenarioProcess {
    pub fn code_size(&self) -> u64 {
        let end = self
            .scripts
            .iter()
            .map(|s| s.offset + s.ops.len() as u64 * OP_SIZE)
            .max()
            .unwrap_or(0);
        align_up(end.max(OP_SIZE), PAGE_SIZE)
    }

    /// Registers the scripts at `base` and describes the process image.
    pub fn image(&self, base: VAddr, book: &ScriptBook) -> Result<ProgramImage> {
        if !self.scripts.iter().any(|s| s.offset == 0) {
            bail!("process {} has no script at offset 0", self.name);
        }
        if let Some(script) = self.scripts.iter().find(|s| s.offset % OP_SIZE != 0) {
            bail!("process {}: script offset {:#x} is misaligned", self.name, script.offset);
        }
        let code_size = self.code_size();
        if code_size > PROCESS_STRIDE / 2 {
            bail!("process {} has too much code", self.name);
        }
        for script in &self.scripts {
            book.insert(base + script.offset, script.ops.clone());
        }

        let mut image = ProgramImage::code_only(&self.name, code_size);
        image.priority = self.priority;
        image.entry = base;
        image.segments[0].addr = base;
        if let Some(data) = &self.data {
            let bytes = hex::decode(data.trim())
                .with_context(|| format!("process {}: data is not hex", self.name))?;
            image.segments.push(Segment {
                addr: base + code_size,
                size: align_up(bytes.len().max(1) as u64, PAGE_SIZE),
                data: bytes,
                permission: MemoryPermission::READ_WRITE,
            });
        }
        Ok(image)
    }
}
