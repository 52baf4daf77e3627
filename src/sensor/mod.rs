//! Sampling sensor process control.

use std::process::Stdio;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::catalog::EventId;
use crate::config::SensorConfig;

/// Out-of-process sampler driven by the controller.
pub trait SensorProcess: Send {
    /// Start sampling the given events.
    fn start(
        &mut self,
        events: &[EventId],
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Stop sampling. Stopping a stopped sensor is a no-op.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Sensor running as a child process, one event flag per monitored event.
pub struct HwpcSensor {
    cfg: SensorConfig,
    child: Option<Child>,
}

impl HwpcSensor {
    pub fn new(cfg: SensorConfig) -> Self {
        Self { cfg, child: None }
    }

    /// Arguments for a run over `events`.
    pub fn arguments(&self, events: &[EventId]) -> Vec<String> {
        let mut args = Vec::with_capacity(self.cfg.args.len() + events.len() * 2);
        args.extend(self.cfg.args.iter().cloned());
        for event in events {
            args.push(self.cfg.event_flag.clone());
            args.push(event.clone());
        }
        args
    }

    /// Process id of the running sensor, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn is_running(&self) -> bool {
        self.child.is_some()
    }
}

impl SensorProcess for HwpcSensor {
    async fn start(&mut self, events: &[EventId]) -> Result<()> {
        if self.child.is_some() {
            self.stop().await?;
        }

        let args = self.arguments(events);
        let child = Command::new(&self.cfg.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("spawning sensor {}", self.cfg.program))?;

        info!(
            program = %self.cfg.program,
            pid = child.id(),
            events = ?events,
            "sensor started",
        );

        self.child = Some(child);

        Ok(())
    }

    async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        let pid = child.id();

        // The sensor may have exited on its own since the last start.
        if let Some(status) = child.try_wait().context("polling sensor")? {
            warn!(pid, %status, "sensor had already exited");
            return Ok(());
        }

        child.start_kill().context("signalling sensor")?;
        let status = child.wait().await.context("waiting for sensor exit")?;

        if status.code().is_some_and(|code| code != 0) {
            warn!(pid, %status, "sensor exited with failure status");
        } else {
            info!(pid, %status, "sensor stopped");
        }

        Ok(())
    }
}
