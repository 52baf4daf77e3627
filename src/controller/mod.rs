//! Reconciliation of control commands into sensor restarts.
//!
//! Commands are handled strictly one at a time, in channel order. A command
//! restarts the sensor only when the resolved events differ, as a set, from
//! the ones currently monitored.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::catalog::EventId;
use crate::control::{ControlChannel, ControlCommand};
use crate::export::health::HealthMetrics;
use crate::selection::SelectionEngine;
use crate::sensor::SensorProcess;

/// Result of handling a single control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The monitored set did not change; the sensor was left alone.
    Ignored,
    /// The sensor was stopped and started with the new events.
    Restarted,
}

/// Returns true if both lists name the same events, ignoring order and
/// duplicates.
pub fn same_events(a: &[EventId], b: &[EventId]) -> bool {
    let a: HashSet<&str> = a.iter().map(String::as_str).collect();
    let b: HashSet<&str> = b.iter().map(String::as_str).collect();
    a == b
}

/// Drives the sensor from the control channel.
pub struct Controller<C, S> {
    engine: SelectionEngine,
    channel: C,
    sensor: S,
    current_events: Vec<EventId>,
    metrics: Option<Arc<HealthMetrics>>,
}

impl<C, S> Controller<C, S>
where
    C: ControlChannel,
    S: SensorProcess,
{
    /// Create a controller with an empty monitored set.
    pub fn new(engine: SelectionEngine, channel: C, sensor: S) -> Self {
        Self {
            engine,
            channel,
            sensor,
            current_events: Vec::new(),
            metrics: None,
        }
    }

    /// Report progress to the given health metrics.
    pub fn with_metrics(mut self, metrics: Arc<HealthMetrics>) -> Self {
        metrics.set_budget(self.engine.budget());
        metrics.pool_remaining.set(self.engine.pool_len() as f64);
        self.metrics = Some(metrics);
        self
    }

    /// Events the sensor is currently asked to monitor.
    pub fn current_events(&self) -> &[EventId] {
        &self.current_events
    }

    pub fn engine(&self) -> &SelectionEngine {
        &self.engine
    }

    pub fn sensor(&self) -> &S {
        &self.sensor
    }

    /// Process control commands until the channel or the sensor fails.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            pool = self.engine.pool_len(),
            general_slots = self.engine.budget().general_slots,
            "watching for control commands",
        );

        loop {
            let command = self
                .channel
                .next()
                .await
                .context("receiving control command")?;

            self.handle(&command).await?;
        }
    }

    /// Run until the controller fails or `shutdown` resolves.
    ///
    /// A shutdown ends the run successfully and leaves the sensor as it is.
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = Result<&'static str>>,
    {
        tokio::select! {
            result = self.run() => result,
            signal = shutdown => {
                let signal = signal?;
                info!(signal, "shutting down");
                Ok(())
            }
        }
    }

    /// Apply one control command.
    pub async fn handle(&mut self, command: &ControlCommand) -> Result<Outcome> {
        debug!(
            timestamp = %command.timestamp,
            sensor = %command.sensor,
            action = %command.action,
            parameters = ?command.parameters,
            "received control command",
        );

        if let Some(metrics) = &self.metrics {
            metrics.commands_received.inc();
        }

        let events = self.engine.resolve(&command.parameters);

        if let Some(metrics) = &self.metrics {
            metrics.pool_remaining.set(self.engine.pool_len() as f64);
        }

        if same_events(&self.current_events, &events) {
            info!(events = ?events, "monitored events unchanged, ignoring command");
            if let Some(metrics) = &self.metrics {
                metrics.commands_ignored.inc();
            }
            return Ok(Outcome::Ignored);
        }

        let started = Instant::now();

        self.sensor.stop().await.context("stopping sensor")?;
        self.sensor
            .start(&events)
            .await
            .context("starting sensor")?;

        info!(
            previous = ?self.current_events,
            events = ?events,
            "sensor restarted with new events",
        );

        if let Some(metrics) = &self.metrics {
            metrics.sensor_restarts.inc();
            metrics
                .sensor_restart_duration
                .observe(started.elapsed().as_secs_f64());
            metrics.monitored_events.set(events.len() as f64);
        }

        self.current_events = events;

        Ok(Outcome::Restarted)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::bail;
    use chrono::Utc;

    use super::*;
    use crate::catalog::CounterBudget;
    use crate::control::{queue, ControlError, QueueChannel};

    /// Sensor recording every call.
    #[derive(Default)]
    struct RecordingSensor {
        calls: Vec<String>,
        fail_start: bool,
    }

    impl SensorProcess for RecordingSensor {
        async fn start(&mut self, events: &[EventId]) -> Result<()> {
            if self.fail_start {
                bail!("sensor binary missing");
            }
            self.calls.push(format!("start {}", events.join(",")));
            Ok(())
        }

        async fn stop(&mut self) -> Result<()> {
            self.calls.push("stop".to_string());
            Ok(())
        }
    }

    fn ids(events: &[&str]) -> Vec<EventId> {
        events.iter().map(|e| (*e).to_string()).collect()
    }

    fn command(parameters: &[Option<&str>]) -> ControlCommand {
        ControlCommand {
            timestamp: Utc::now(),
            sensor: "hwpc".to_string(),
            target: "node-1".to_string(),
            action: "set_events".to_string(),
            parameters: parameters.iter().map(|p| p.map(str::to_string)).collect(),
        }
    }

    fn controller(
        general_slots: usize,
        fixed: &[&str],
        pool: &[&str],
    ) -> (
        tokio::sync::mpsc::Sender<ControlCommand>,
        Controller<QueueChannel, RecordingSensor>,
    ) {
        let budget = CounterBudget {
            fixed_slots: 3,
            general_slots,
        };
        let engine = SelectionEngine::with_pool(budget, ids(fixed), ids(pool));
        let (tx, channel) = queue("node-1", 16);
        (tx, Controller::new(engine, channel, RecordingSensor::default()))
    }

    #[test]
    fn test_same_events_ignores_order_and_duplicates() {
        assert!(same_events(&ids(&["A", "B"]), &ids(&["B", "A", "A"])));
        assert!(!same_events(&ids(&["A", "B"]), &ids(&["A", "C"])));
        assert!(same_events(&[], &[]));
        assert!(!same_events(&[], &ids(&["A"])));
    }

    #[tokio::test]
    async fn test_first_command_restarts() {
        let (_tx, mut ctl) = controller(4, &["INSTR"], &["E3", "E2", "E1"]);

        let outcome = ctl.handle(&command(&[None, None])).await.expect("handled");

        assert_eq!(outcome, Outcome::Restarted);
        assert_eq!(ctl.current_events(), ids(&["INSTR", "E1", "E2"]).as_slice());
        assert_eq!(ctl.sensor().calls, vec!["stop", "start INSTR,E1,E2"]);
    }

    #[tokio::test]
    async fn test_changed_set_restarts() {
        let (_tx, mut ctl) = controller(4, &["INSTR"], &["E3", "E2", "E1"]);
        ctl.handle(&command(&[None, None])).await.expect("handled");

        let outcome = ctl.handle(&command(&[Some("E9")])).await.expect("handled");

        assert_eq!(outcome, Outcome::Restarted);
        assert_eq!(ctl.current_events(), ids(&["INSTR", "E9", "E3"]).as_slice());
        assert_eq!(
            ctl.sensor().calls,
            vec!["stop", "start INSTR,E1,E2", "stop", "start INSTR,E9,E3"]
        );
    }

    #[tokio::test]
    async fn test_same_set_is_ignored() {
        // Empty pool: explicit entries fully determine the set.
        let (_tx, mut ctl) = controller(4, &["INSTR"], &[]);
        ctl.handle(&command(&[Some("A"), Some("B")]))
            .await
            .expect("handled");

        let outcome = ctl
            .handle(&command(&[Some("B"), Some("A"), Some("B")]))
            .await
            .expect("handled");

        assert_eq!(outcome, Outcome::Ignored);
        assert_eq!(ctl.sensor().calls, vec!["stop", "start INSTR,A,B"]);
        assert_eq!(ctl.current_events(), ids(&["INSTR", "A", "B"]).as_slice());
    }

    #[tokio::test]
    async fn test_empty_resolution_on_startup_is_ignored() {
        let (_tx, mut ctl) = controller(0, &[], &["E1"]);

        let outcome = ctl.handle(&command(&[])).await.expect("handled");

        assert_eq!(outcome, Outcome::Ignored);
        assert!(ctl.sensor().calls.is_empty());
    }

    #[tokio::test]
    async fn test_sensor_failure_propagates_and_keeps_state() {
        let (_tx, mut ctl) = controller(2, &["INSTR"], &["E1"]);
        ctl.sensor.fail_start = true;

        let err = ctl
            .handle(&command(&[None]))
            .await
            .expect_err("should fail");

        assert!(format!("{err:#}").contains("starting sensor"));
        assert!(ctl.current_events().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_closed_channel() {
        let (tx, mut ctl) = controller(4, &["INSTR"], &["E3", "E2", "E1"]);
        tx.send(command(&[None, None])).await.expect("send");
        tx.send(command(&[Some("E9")])).await.expect("send");
        drop(tx);

        let err = ctl.run().await.expect_err("channel closed");

        assert!(matches!(
            err.downcast_ref::<ControlError>(),
            Some(ControlError::Closed)
        ));
        assert_eq!(ctl.current_events(), ids(&["INSTR", "E9", "E3"]).as_slice());
        assert_eq!(ctl.sensor().calls.len(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_ends_run_without_stopping_sensor() {
        let (tx, mut ctl) = controller(4, &["INSTR"], &["E3", "E2", "E1"]);
        tx.send(command(&[None, None])).await.expect("send");
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let shutdown = async move {
            stop_rx.await.context("shutdown sender dropped")?;
            Ok::<_, anyhow::Error>("SIGTERM")
        };
        let trigger = async move {
            // Let the command through before the signal arrives.
            while tx.capacity() < tx.max_capacity() {
                tokio::task::yield_now().await;
            }
            tokio::task::yield_now().await;
            let _ = stop_tx.send(());
            tx
        };

        let (result, tx) = tokio::join!(ctl.run_until(shutdown), trigger);

        result.expect("shutdown is a clean exit");
        assert_eq!(ctl.sensor().calls, vec!["stop", "start INSTR,E1,E2"]);
        assert_eq!(ctl.current_events(), ids(&["INSTR", "E1", "E2"]).as_slice());
        drop(tx);
    }

    #[tokio::test]
    async fn test_failed_shutdown_signal_propagates() {
        let (_tx, mut ctl) = controller(4, &[], &[]);

        let shutdown =
            async { Err::<&'static str, _>(anyhow::anyhow!("registering SIGTERM handler")) };

        let err = ctl
            .run_until(shutdown)
            .await
            .expect_err("should fail");

        assert!(err.to_string().contains("SIGTERM"));
        assert!(ctl.sensor().calls.is_empty());
    }

    #[tokio::test]
    async fn test_metrics_track_outcomes() {
        let metrics = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let (_tx, ctl) = controller(4, &[], &[]);
        let mut ctl = ctl.with_metrics(Arc::clone(&metrics));

        ctl.handle(&command(&[Some("A")])).await.expect("handled");
        ctl.handle(&command(&[Some("A")])).await.expect("handled");

        assert_eq!(metrics.commands_received.get(), 2.0);
        assert_eq!(metrics.commands_ignored.get(), 1.0);
        assert_eq!(metrics.sensor_restarts.get(), 1.0);
        assert_eq!(metrics.monitored_events.get(), 1.0);
        assert_eq!(metrics.general_slots.get(), 4.0);
    }
}
