//! Control commands and the channels that deliver them.
//!
//! A [`ControlChannel`] hands out the next command scoped to this host and
//! blocks until one arrives. The controller does not know whether commands
//! come from an HTTP endpoint, a pipe, or anything else.

pub mod http;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tokio::sync::mpsc;
use tracing::debug;

use crate::catalog::EventId;

/// Request for a particular mix of events on a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlCommand {
    /// When the command was issued.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Sensor the command is addressed to. Informational.
    #[serde(default)]
    pub sensor: String,

    /// Host the command is scoped to.
    #[serde(alias = "hostname")]
    pub target: String,

    /// Requested action. Informational.
    #[serde(default)]
    pub action: String,

    /// Requested events; `None` (or an empty name) leaves the pick to the
    /// selection engine.
    #[serde(default, alias = "events")]
    pub parameters: Vec<Option<EventId>>,
}

/// Errors surfaced by a control channel.
#[derive(Error, Debug)]
pub enum ControlError {
    #[error("control channel closed")]
    Closed,

    #[error("malformed control command on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("reading control channel: {0}")]
    Io(#[from] std::io::Error),
}

/// Ordered source of control commands for one host.
pub trait ControlChannel: Send {
    /// Wait for the next command targeting this host.
    fn next(
        &mut self,
    ) -> impl std::future::Future<Output = Result<ControlCommand, ControlError>> + Send;
}

/// Channel fed through an in-process queue.
pub struct QueueChannel {
    hostname: String,
    rx: mpsc::Receiver<ControlCommand>,
}

/// Create a bounded queue and the channel draining it.
pub fn queue(
    hostname: impl Into<String>,
    capacity: usize,
) -> (mpsc::Sender<ControlCommand>, QueueChannel) {
    let (tx, rx) = mpsc::channel(capacity);
    let channel = QueueChannel {
        hostname: hostname.into(),
        rx,
    };
    (tx, channel)
}

impl ControlChannel for QueueChannel {
    async fn next(&mut self) -> Result<ControlCommand, ControlError> {
        loop {
            let command = self.rx.recv().await.ok_or(ControlError::Closed)?;

            if command.target == self.hostname {
                return Ok(command);
            }

            debug!(target_host = %command.target, "skipping command for another host");
        }
    }
}

/// Channel reading newline-delimited JSON commands.
pub struct LineChannel<R> {
    hostname: String,
    lines: Lines<R>,
    line_no: usize,
}

impl<R> LineChannel<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(hostname: impl Into<String>, reader: R) -> Self {
        Self {
            hostname: hostname.into(),
            lines: reader.lines(),
            line_no: 0,
        }
    }
}

impl<R> ControlChannel for LineChannel<R>
where
    R: AsyncBufRead + Unpin + Send,
{
    async fn next(&mut self) -> Result<ControlCommand, ControlError> {
        loop {
            let line = self.lines.next_line().await?.ok_or(ControlError::Closed)?;
            self.line_no += 1;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let command: ControlCommand =
                serde_json::from_str(line).map_err(|source| ControlError::Malformed {
                    line: self.line_no,
                    source,
                })?;

            if command.target == self.hostname {
                return Ok(command);
            }

            debug!(target_host = %command.target, "skipping command for another host");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn command(target: &str, parameters: &[Option<&str>]) -> ControlCommand {
        ControlCommand {
            timestamp: Utc::now(),
            sensor: "hwpc".to_string(),
            target: target.to_string(),
            action: "set_events".to_string(),
            parameters: parameters.iter().map(|p| p.map(str::to_string)).collect(),
        }
    }

    #[test]
    fn test_deserialize_with_nulls() {
        let json = r#"{
            "timestamp": "2024-03-01T12:00:00Z",
            "sensor": "hwpc",
            "target": "node-1",
            "action": "set_events",
            "parameters": ["L2_RQSTS:MISS", null, null]
        }"#;
        let cmd: ControlCommand = serde_json::from_str(json).expect("should parse");
        assert_eq!(cmd.target, "node-1");
        assert_eq!(
            cmd.parameters,
            vec![Some("L2_RQSTS:MISS".to_string()), None, None]
        );
        assert_eq!(cmd.timestamp.to_rfc3339(), "2024-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_deserialize_legacy_field_names() {
        let json = r#"{"hostname": "node-2", "events": [null]}"#;
        let cmd: ControlCommand = serde_json::from_str(json).expect("should parse");
        assert_eq!(cmd.target, "node-2");
        assert_eq!(cmd.parameters, vec![None]);
        assert!(cmd.sensor.is_empty());
    }

    #[test]
    fn test_deserialize_requires_target() {
        assert!(serde_json::from_str::<ControlCommand>(r#"{"parameters": []}"#).is_err());
    }

    #[tokio::test]
    async fn test_queue_channel_filters_hosts() {
        let (tx, mut channel) = queue("node-1", 8);
        tx.send(command("node-2", &[None])).await.expect("send");
        tx.send(command("node-1", &[Some("E1")])).await.expect("send");

        let cmd = channel.next().await.expect("command");
        assert_eq!(cmd.target, "node-1");
        assert_eq!(cmd.parameters, vec![Some("E1".to_string())]);
    }

    #[tokio::test]
    async fn test_queue_channel_preserves_order() {
        let (tx, mut channel) = queue("node-1", 8);
        for event in ["E1", "E2", "E3"] {
            tx.send(command("node-1", &[Some(event)])).await.expect("send");
        }

        for event in ["E1", "E2", "E3"] {
            let cmd = channel.next().await.expect("command");
            assert_eq!(cmd.parameters, vec![Some(event.to_string())]);
        }
    }

    #[tokio::test]
    async fn test_queue_channel_closed() {
        let (tx, mut channel) = queue("node-1", 1);
        drop(tx);
        assert!(matches!(channel.next().await, Err(ControlError::Closed)));
    }

    #[tokio::test]
    async fn test_line_channel_reads_commands() {
        let input = concat!(
            "{\"target\": \"node-9\", \"parameters\": [null]}\n",
            "\n",
            "{\"target\": \"node-1\", \"parameters\": [\"E1\", null]}\n",
        );
        let mut channel = LineChannel::new("node-1", input.as_bytes());

        let cmd = channel.next().await.expect("command");
        assert_eq!(cmd.parameters, vec![Some("E1".to_string()), None]);

        assert!(matches!(channel.next().await, Err(ControlError::Closed)));
    }

    #[tokio::test]
    async fn test_line_channel_malformed_line() {
        let input = "{\"target\": \"node-1\"}\nnot json\n";
        let mut channel = LineChannel::new("node-1", input.as_bytes());

        channel.next().await.expect("first command");
        match channel.next().await {
            Err(ControlError::Malformed { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected malformed error, got {other:?}"),
        }
    }
}
