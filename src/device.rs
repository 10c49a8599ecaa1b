//! The switch side of a batch: something that can open a configuration session
//! and run command lists in it. Vendor drivers implement these traits; this
//! crate only sequences calls to them.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, Error)]
pub enum DeviceError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("saving configuration failed: {0}")]
    Save(String),
}

/// A switch whose configuration sessions must not overlap.
#[async_trait]
pub trait Device: Send + Sync {
    /// Name of the switch, used to scope its queue and locks.
    fn switch_name(&self) -> &str;

    /// Open one configuration session. Every batch a worker drains runs in
    /// the same session.
    async fn open_session(&self) -> Result<Box<dyn DeviceSession>, DeviceError>;
}

/// An open configuration session, closed when dropped.
#[async_trait]
pub trait DeviceSession: Send {
    /// Run one batch's commands in order and return the device output.
    async fn execute(&mut self, cmds: &[String]) -> Result<String, DeviceError>;

    /// Persist the running configuration. Called once per session.
    async fn save_configuration(&mut self) -> Result<(), DeviceError>;
}

/// A device that logs commands instead of sending them and echoes them back
/// as output. Used by `swbatchctl submit` to exercise the queue end to end.
pub struct DryRunDevice {
    switch: String,
}

impl DryRunDevice {
    pub fn new(switch: impl Into<String>) -> Self {
        Self {
            switch: switch.into(),
        }
    }
}

#[async_trait]
impl Device for DryRunDevice {
    fn switch_name(&self) -> &str {
        &self.switch
    }

    async fn open_session(&self) -> Result<Box<dyn DeviceSession>, DeviceError> {
        info!(switch = %self.switch, "dry-run: opening session");
        Ok(Box::new(DryRunSession {
            switch: self.switch.clone(),
        }))
    }
}

struct DryRunSession {
    switch: String,
}

#[async_trait]
impl DeviceSession for DryRunSession {
    async fn execute(&mut self, cmds: &[String]) -> Result<String, DeviceError> {
        for cmd in cmds {
            info!(switch = %self.switch, cmd = %cmd, "dry-run: command");
        }
        Ok(cmds.join("\n"))
    }

    async fn save_configuration(&mut self) -> Result<(), DeviceError> {
        info!(switch = %self.switch, "dry-run: save configuration");
        Ok(())
    }
}
