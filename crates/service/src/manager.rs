//! Named service registry, the state behind `sm:`.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use kernel::{Kernel, ObjectRef};
use log::{debug, info};
use types::result::sm;
use types::ResultCode;

use crate::interface::SessionHandler;

/// Longest name the registry accepts.
pub const MAX_NAME_LEN: usize = 15;
/// Longest name that fits the u64 `sm:` uses on the wire.
pub const MAX_WIRE_NAME_LEN: usize = 8;

/// Builds the handler for a new session to an HLE service.
pub type HandlerFactory = Arc<dyn Fn() -> Box<dyn SessionHandler> + Send + Sync>;

/// Wraps a constructor of one concrete handler type as a factory.
pub fn factory<H, F>(make: F) -> HandlerFactory
where
    H: SessionHandler + 'static,
    F: Fn() -> H + Send + Sync + 'static,
{
    Arc::new(move || -> Box<dyn SessionHandler> { Box::new(make()) })
}

enum Entry {
    /// Served by the host: sessions are dispatched to handlers `factory` makes.
    Hle { port: ObjectRef, factory: HandlerFactory },
    /// Registered by a guest process through RegisterService.
    Guest { port: ObjectRef },
}

impl Entry {
    fn port(&self) -> &ObjectRef {
        match self {
            Entry::Hle { port, .. } | Entry::Guest { port } => port,
        }
    }
}

pub struct ServiceManager {
    kernel: Kernel,
    entries: Mutex<BTreeMap<String, Entry>>,
}

pub fn validate_name(name: &str) -> Result<(), ResultCode> {
    if name.is_empty() || name.len() > MAX_NAME_LEN || !name.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(sm::INVALID_SERVICE_NAME);
    }
    Ok(())
}

/// Unpacks a name sent as a little-endian u64 padded with zeros.
pub fn decode_name(raw: u64) -> Result<String, ResultCode> {
    let bytes = raw.to_le_bytes();
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    if bytes[len..].iter().any(|&b| b != 0) {
        return Err(sm::INVALID_SERVICE_NAME);
    }
    let name = std::str::from_utf8(&bytes[..len]).map_err(|_| sm::INVALID_SERVICE_NAME)?;
    validate_name(name)?;
    Ok(name.to_string())
}

pub fn encode_name(name: &str) -> Result<u64, ResultCode> {
    if name.len() > MAX_WIRE_NAME_LEN {
        return Err(sm::INVALID_SERVICE_NAME);
    }
    let mut bytes = [0u8; 8];
    bytes[..name.len()].copy_from_slice(name.as_bytes());
    Ok(u64::from_le_bytes(bytes))
}

impl ServiceManager {
    pub fn new(kernel: Kernel) -> Arc<Self> {
        Arc::new(Self {
            kernel,
            entries: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a host-served service reachable through `sm:`.
    pub fn register_hle(&self, name: &str, max_sessions: u32, factory: HandlerFactory) -> Result<(), ResultCode> {
        validate_name(name)?;
        let mut entries = self.entries();
        if entries.contains_key(name) {
            return Err(sm::ALREADY_REGISTERED);
        }
        let port = self.kernel.create_hle_port(name, max_sessions);
        entries.insert(name.to_string(), Entry::Hle { port, factory });
        info!("service {} registered", name);
        Ok(())
    }

    /// Also exposes `name` to ConnectToNamedPort, the way `sm:` itself is
    /// reached.
    pub fn register_named_hle(&self, name: &str, max_sessions: u32, factory: HandlerFactory) -> Result<(), ResultCode> {
        self.register_hle(name, max_sessions, factory)?;
        let port = self.port(name)?;
        self.kernel.register_named_port(name, &port)
    }

    /// Registers a guest-served service; returns the server port for the
    /// guest to accept sessions on.
    pub fn register_guest(&self, name: &str, max_sessions: u32) -> Result<ObjectRef, ResultCode> {
        validate_name(name)?;
        let mut entries = self.entries();
        if entries.contains_key(name) {
            return Err(sm::ALREADY_REGISTERED);
        }
        let (server, client) = self.kernel.create_port(name, max_sessions);
        entries.insert(name.to_string(), Entry::Guest { port: client });
        info!("guest service {} registered", name);
        Ok(server)
    }

    pub fn unregister(&self, name: &str) -> Result<(), ResultCode> {
        validate_name(name)?;
        let removed = self.entries().remove(name).ok_or(sm::NOT_REGISTERED)?;
        if matches!(removed, Entry::Hle { .. }) {
            // only the built-in ports are named; ignore the miss for the rest
            let _ = self.kernel.unregister_named_port(name);
        }
        info!("service {} unregistered", name);
        Ok(())
    }

    fn port(&self, name: &str) -> Result<ObjectRef, ResultCode> {
        self.entries()
            .get(name)
            .map(|e| e.port().clone())
            .ok_or(sm::NOT_REGISTERED)
    }

    /// Opens a session to `name` for process `pid`.
    pub fn connect(&self, name: &str, pid: Option<u64>) -> Result<ObjectRef, ResultCode> {
        validate_name(name)?;
        let port = self.port(name)?;
        debug!("connect {} for pid {:?}", name, pid);
        self.kernel.connect_port(&port, pid)
    }

    /// Fresh handler for a session opened through the HLE port `name`.
    pub fn handler_for(&self, name: &str) -> Option<Box<dyn SessionHandler>> {
        let factory = match self.entries().get(name) {
            Some(Entry::Hle { factory, .. }) => factory.clone(),
            _ => return None,
        };
        Some(factory())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.entries().contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.entries().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_the_wire_form() {
        let raw = encode_name("fatal:u").unwrap();
        assert_eq!(decode_name(raw).unwrap(), "fatal:u");
        assert_eq!(encode_name("toolongname"), Err(sm::INVALID_SERVICE_NAME));
    }

    #[test]
    fn malformed_wire_names_are_rejected() {
        assert_eq!(decode_name(0), Err(sm::INVALID_SERVICE_NAME));
        // a zero byte followed by more characters
        let raw = u64::from_le_bytes(*b"ab\0cd\0\0\0");
        assert_eq!(decode_name(raw), Err(sm::INVALID_SERVICE_NAME));
    }
}
