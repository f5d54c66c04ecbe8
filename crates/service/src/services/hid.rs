//! `hid`: controller input published through shared memory.

use std::sync::{Arc, Mutex};

use kernel::{Kernel, ObjectRef};
use log::debug;
use once_cell::sync::Lazy;
use types::{MemoryPermission, ResultCode};

use crate::context::RequestContext;
use crate::interface::{CommandTable, HandlerResult, SessionHandler};

pub const NAME: &str = "hid";
pub const SHARED_MEMORY_SIZE: u64 = 0x40000;
/// Offset of the first controller's state in the shared block.
pub const NPAD_OFFSET: u64 = 0x9A00;
pub const NPAD_ENTRY_SIZE: u64 = 0x5000;
pub const NPAD_COUNT: usize = 10;

/// Latest state of one controller as laid out in shared memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NpadState {
    pub buttons: u64,
    pub left_stick: (i32, i32),
    pub right_stick: (i32, i32),
    pub connected: bool,
}

/// State shared by every `hid` session: the input block and the style set
/// the application asked for.
pub struct HidShared {
    kernel: Kernel,
    shared_memory: ObjectRef,
    supported_styles: Mutex<u32>,
    sampling: Mutex<[u64; NPAD_COUNT]>,
}

impl HidShared {
    pub fn new(kernel: Kernel) -> Result<Arc<Self>, ResultCode> {
        let shared_memory = kernel.create_shared_memory(
            SHARED_MEMORY_SIZE,
            MemoryPermission::READ_WRITE,
            MemoryPermission::READ,
        )?;
        Ok(Arc::new(Self {
            kernel,
            shared_memory,
            supported_styles: Mutex::new(0),
            sampling: Mutex::new([0; NPAD_COUNT]),
        }))
    }

    pub fn shared_memory(&self) -> &ObjectRef {
        &self.shared_memory
    }

    /// Publishes a new sample for controller `index`.
    pub fn update_npad(&self, index: usize, state: &NpadState) -> Result<(), ResultCode> {
        if index >= NPAD_COUNT {
            return Err(ResultCode::OUT_OF_RANGE);
        }
        let sample = {
            let mut sampling = self.sampling.lock().unwrap_or_else(|e| e.into_inner());
            sampling[index] += 1;
            sampling[index]
        };
        let mut entry = Vec::with_capacity(0x28);
        entry.extend_from_slice(&sample.to_le_bytes());
        entry.extend_from_slice(&state.buttons.to_le_bytes());
        for v in [state.left_stick.0, state.left_stick.1, state.right_stick.0, state.right_stick.1] {
            entry.extend_from_slice(&v.to_le_bytes());
        }
        entry.extend_from_slice(&(state.connected as u32).to_le_bytes());
        let offset = NPAD_OFFSET + index as u64 * NPAD_ENTRY_SIZE;
        self.kernel
            .write_shared_memory(&self.shared_memory, offset, &entry)
    }

    pub fn supported_styles(&self) -> u32 {
        *self.supported_styles.lock().unwrap_or_else(|e| e.into_inner())
    }
}

static COMMANDS: Lazy<CommandTable<HidService>> = Lazy::new(|| {
    CommandTable::new(NAME)
        .with(0, "CreateAppletResource", HidService::create_applet_resource)
        .with(1, "ActivateDebugPad", HidService::activate)
        .with(11, "ActivateTouchScreen", HidService::activate)
        .with(21, "ActivateMouse", HidService::activate)
        .with(31, "ActivateKeyboard", HidService::activate)
        .with(100, "SetSupportedNpadStyleSet", HidService::set_supported_npad_style_set)
        .with(101, "GetSupportedNpadStyleSet", HidService::get_supported_npad_style_set)
        .with(103, "ActivateNpad", HidService::activate_npad)
});

static APPLET_RESOURCE_COMMANDS: Lazy<CommandTable<AppletResource>> = Lazy::new(|| {
    CommandTable::new("IAppletResource").with(0, "GetSharedMemoryHandle", AppletResource::get_shared_memory_handle)
});

pub struct HidService {
    shared: Arc<HidShared>,
}

impl HidService {
    pub fn new(shared: Arc<HidShared>) -> Self {
        Self { shared }
    }

    fn create_applet_resource(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let aruid = ctx.pop_u64()?;
        debug!("hid: applet resource for aruid {:#x}", aruid);
        ctx.push_interface(Box::new(AppletResource {
            shared: self.shared.clone(),
        }));
        Ok(())
    }

    fn activate(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        debug!("hid: activate (command {}) for pid {}", ctx.command_id, ctx.pid);
        Ok(())
    }

    fn set_supported_npad_style_set(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let styles = ctx.pop_u32()?;
        *self
            .shared
            .supported_styles
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = styles;
        Ok(())
    }

    fn get_supported_npad_style_set(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        ctx.push_u32(self.shared.supported_styles());
        Ok(())
    }

    /// Marks the first controller connected so guests see a live pad.
    fn activate_npad(&mut self, _ctx: &mut RequestContext<'_>) -> HandlerResult {
        let state = NpadState {
            connected: true,
            ..Default::default()
        };
        self.shared.update_npad(0, &state)
    }
}

impl SessionHandler for HidService {
    fn name(&self) -> &str {
        NAME
    }

    fn handle_request(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        COMMANDS.dispatch(self, ctx)
    }
}

pub struct AppletResource {
    shared: Arc<HidShared>,
}

impl AppletResource {
    fn get_shared_memory_handle(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        ctx.copy_object(self.shared.shared_memory.clone());
        Ok(())
    }
}

impl SessionHandler for AppletResource {
    fn name(&self) -> &str {
        "IAppletResource"
    }

    fn handle_request(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        APPLET_RESOURCE_COMMANDS.dispatch(self, ctx)
    }
}
