use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpu::ExecutorFactory;
use kernel::{Kernel, KernelEvent};
use log::{debug, error, info};
use service::{register_builtin, BuiltinServices, ServiceManager};

use crate::config::SystemConfig;
use crate::error::SystemError;
use crate::loader::{self, ProgramImage};

/// An emulation session. Nothing is global: two `System`s in one host
/// process share no state.
pub struct System {
    config: SystemConfig,
    kernel: Kernel,
    manager: Arc<ServiceManager>,
    services: BuiltinServices,
    factory: Arc<dyn ExecutorFactory>,
    workers: Vec<JoinHandle<()>>,
    service_thread: Option<JoinHandle<()>>,
}

impl System {
    /// Builds the kernel and registers the built-in services. Nothing runs
    /// until `start`.
    pub fn new(config: SystemConfig, factory: Arc<dyn ExecutorFactory>) -> Result<Self, SystemError> {
        config.validate()?;
        let kernel = Kernel::new(config.kernel.clone());
        let manager = ServiceManager::new(kernel.clone());
        let services = register_builtin(&manager, &config.services).map_err(SystemError::Service)?;
        Ok(Self {
            config,
            kernel,
            manager,
            services,
            factory,
            workers: Vec::new(),
            service_thread: None,
        })
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn service_manager(&self) -> &Arc<ServiceManager> {
        &self.manager
    }

    pub fn services(&self) -> &BuiltinServices {
        &self.services
    }

    pub fn is_running(&self) -> bool {
        self.service_thread.is_some() && !self.kernel.is_shut_down()
    }

    /// Spawns one worker per core and the service thread.
    pub fn start(&mut self) -> Result<(), SystemError> {
        if self.service_thread.is_some() || self.kernel.is_shut_down() {
            return Err(SystemError::AlreadyStarted);
        }
        self.workers = self.kernel.start(self.factory.clone())?;
        let service_thread = match service::spawn(self.kernel.clone(), self.manager.clone()) {
            Ok(handle) => handle,
            Err(e) => {
                self.shutdown();
                return Err(e.into());
            }
        };
        self.service_thread = Some(service_thread);
        info!(
            "system started: {} cores, services {:?}",
            self.config.kernel.num_cores,
            self.manager.names()
        );
        Ok(())
    }

    pub fn load_program(&self, image: &ProgramImage) -> Result<u64, SystemError> {
        Ok(loader::load_program(&self.kernel, image)?)
    }

    pub fn load_elf(&self, name: &str, bytes: &[u8]) -> Result<u64, SystemError> {
        Ok(loader::load_elf(&self.kernel, name, bytes)?)
    }

    /// Waits for `pid` to exit. Fatal events stay queued for `events`.
    pub fn run_until_exit(&self, pid: u64, timeout: Duration) -> Result<(), SystemError> {
        if !self.is_running() {
            return Err(SystemError::NotStarted);
        }
        if self.kernel.wait_for_exit(pid, timeout) {
            debug!("process {} exited", pid);
            Ok(())
        } else {
            Err(SystemError::TimedOut { pid })
        }
    }

    /// Next kernel event: fatal errors, exits and guest debug output.
    pub fn next_event(&self, timeout: Duration) -> Option<KernelEvent> {
        self.kernel.next_event(timeout)
    }

    /// Every event raised within `timeout`, stopping at the first quiet
    /// wait.
    pub fn events(&self, timeout: Duration) -> Vec<KernelEvent> {
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match self.kernel.next_event(left) {
                Some(event) => {
                    if let KernelEvent::Fatal { pid, kind, .. } = &event {
                        error!("process {}: {}", pid, kind);
                    }
                    events.push(event);
                }
                None => break,
            }
        }
        events
    }

    /// Stops every core and the service thread, then waits for them.
    pub fn shutdown(&mut self) {
        self.kernel.shutdown();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("a core worker panicked");
            }
        }
        if let Some(service_thread) = self.service_thread.take() {
            if service_thread.join().is_err() {
                error!("the service thread panicked");
            }
        }
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}
