//! `lm`: structured guest logging.
//!
//! A log packet is a 0x18-byte header followed by chunks of
//! `key: u8, size: uleb128, data`. A long message spans several packets
//! between one with the head flag and one with the tail flag.

use std::sync::{Arc, Mutex};

use log::{debug, error, info, trace, warn, Level};
use once_cell::sync::Lazy;
use types::primitives::FieldReader;

use crate::context::RequestContext;
use crate::interface::{CommandTable, HandlerResult, SessionHandler};

pub const NAME: &str = "lm";

const HEADER_SIZE: usize = 0x18;
const FLAG_HEAD: u16 = 1 << 0;
const FLAG_TAIL: u16 = 1 << 1;

mod field {
    pub const TEXT_LOG: u8 = 2;
    pub const LINE_NUMBER: u8 = 3;
    pub const FILE_NAME: u8 = 4;
    pub const FUNCTION_NAME: u8 = 5;
    pub const MODULE_NAME: u8 = 6;
    pub const THREAD_NAME: u8 = 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Trace,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Severity {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Severity::Trace,
            1 => Severity::Info,
            2 => Severity::Warning,
            3 => Severity::Error,
            _ => Severity::Fatal,
        }
    }

    fn level(self) -> Level {
        match self {
            Severity::Trace => Level::Trace,
            Severity::Info => Level::Info,
            Severity::Warning => Level::Warn,
            Severity::Error | Severity::Fatal => Level::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub pid: u64,
    pub severity: Severity,
    pub message: String,
    pub file: Option<String>,
    pub function: Option<String>,
    pub module: Option<String>,
    pub thread: Option<String>,
    pub line: Option<u32>,
}

impl LogEntry {
    fn new(pid: u64, severity: Severity) -> Self {
        Self {
            pid,
            severity,
            message: String::new(),
            file: None,
            function: None,
            module: None,
            thread: None,
            line: None,
        }
    }
}

/// Collects every completed guest log entry.
#[derive(Debug, Clone, Default)]
pub struct LogSink(Arc<Mutex<Vec<LogEntry>>>);

impl LogSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: LogEntry) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(entry);
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

fn uleb128(r: &mut FieldReader<'_>) -> Option<usize> {
    let mut value = 0usize;
    for shift in (0..64).step_by(7) {
        let byte = r.u8()?;
        value |= ((byte & 0x7F) as usize) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
    }
    None
}

/// (flags, severity, payload size)
fn parse_header(r: &mut FieldReader<'_>) -> Option<(u16, u8, usize)> {
    let _pid = r.u64()?;
    let _thread_context = r.u64()?;
    let flags = r.u8()? as u16 | (r.u8()? as u16) << 8;
    let severity = r.u8()?;
    let _verbosity = r.u8()?;
    let payload_size = r.u32()? as usize;
    Some((flags, severity, payload_size))
}

fn text(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

static SERVICE_COMMANDS: Lazy<CommandTable<LmService>> =
    Lazy::new(|| CommandTable::new(NAME).with(0, "OpenLogger", LmService::open_logger));

static LOGGER_COMMANDS: Lazy<CommandTable<Logger>> = Lazy::new(|| {
    CommandTable::new("ILogger")
        .with(0, "Log", Logger::log)
        .with(1, "SetDestination", Logger::set_destination)
});

pub struct LmService {
    sink: LogSink,
}

impl LmService {
    pub fn new(sink: LogSink) -> Self {
        Self { sink }
    }

    fn open_logger(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        ctx.push_interface(Box::new(Logger {
            pid: ctx.pid,
            sink: self.sink.clone(),
            destination: 0,
            pending: None,
        }));
        Ok(())
    }
}

impl SessionHandler for LmService {
    fn name(&self) -> &str {
        NAME
    }

    fn handle_request(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        SERVICE_COMMANDS.dispatch(self, ctx)
    }
}

pub struct Logger {
    pid: u64,
    sink: LogSink,
    destination: u32,
    pending: Option<LogEntry>,
}

impl Logger {
    fn log(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let packet = ctx.read_buffer(0)?;
        self.parse_packet(&packet);
        Ok(())
    }

    fn set_destination(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        self.destination = ctx.pop_u32()?;
        debug!("lm: pid {} log destination {:#x}", self.pid, self.destination);
        Ok(())
    }

    /// Folds one packet into the pending entry, emitting it on the tail.
    fn parse_packet(&mut self, packet: &[u8]) {
        let header = parse_header(&mut FieldReader::new(packet));
        let Some((flags, severity, payload_size)) = header else {
            warn!("lm: short packet ({} bytes) from pid {}", packet.len(), self.pid);
            return;
        };

        if flags & FLAG_HEAD != 0 || self.pending.is_none() {
            self.pending = Some(LogEntry::new(self.pid, Severity::from_raw(severity)));
        }
        let end = (HEADER_SIZE + payload_size).min(packet.len());
        let mut chunks = FieldReader::new(&packet[..end]);
        chunks.skip(HEADER_SIZE);
        if let Some(entry) = self.pending.as_mut() {
            while chunks.remaining() > 0 {
                let Some(key) = chunks.u8() else { break };
                let Some(data) = uleb128(&mut chunks).and_then(|len| chunks.bytes(len)) else {
                    break;
                };
                match key {
                    field::TEXT_LOG => entry.message.push_str(&text(data)),
                    field::LINE_NUMBER if data.len() >= 4 => {
                        entry.line = Some(u32::from_le_bytes([data[0], data[1], data[2], data[3]]));
                    }
                    field::FILE_NAME => entry.file = Some(text(data)),
                    field::FUNCTION_NAME => entry.function = Some(text(data)),
                    field::MODULE_NAME => entry.module = Some(text(data)),
                    field::THREAD_NAME => entry.thread = Some(text(data)),
                    other => trace!("lm: skipping field {}", other),
                }
            }
        }

        if flags & FLAG_TAIL != 0 {
            if let Some(entry) = self.pending.take() {
                self.emit(entry);
            }
        }
    }

    fn emit(&self, entry: LogEntry) {
        let location = match (&entry.file, entry.line) {
            (Some(file), Some(line)) => format!(" [{}:{}]", file, line),
            (Some(file), None) => format!(" [{}]", file),
            _ => String::new(),
        };
        match entry.severity.level() {
            Level::Error => error!("guest {}{}: {}", entry.pid, location, entry.message),
            Level::Warn => warn!("guest {}{}: {}", entry.pid, location, entry.message),
            Level::Info => info!("guest {}{}: {}", entry.pid, location, entry.message),
            _ => trace!("guest {}{}: {}", entry.pid, location, entry.message),
        }
        self.sink.push(entry);
    }
}

impl SessionHandler for Logger {
    fn name(&self) -> &str {
        "ILogger"
    }

    fn handle_request(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        LOGGER_COMMANDS.dispatch(self, ctx)
    }
}
