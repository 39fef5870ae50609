//! Telemetry samples and the newline-delimited JSON bridge the workers use.
//!
//! Wire format, one object per line:
//!
//! ```text
//! {"stream":"command","force":[-20.0,0.0,0.0]}
//! {"stream":"response","subject":"wheel_rear_left","value":0.043}
//! ```

use std::io::{BufRead, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Sender;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::SweepError;

/// Applied drawbar pull, as force components `[x, y, z]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommandSample {
    pub force: [f64; 3],
    pub arrival_order: u64,
}

impl CommandSample {
    /// The driving value the curve is bucketed by.
    pub fn value(&self) -> f64 {
        self.force[0]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseSample {
    pub subject: String,
    pub value: f64,
    pub arrival_order: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationPair {
    pub command: CommandSample,
    pub response: ResponseSample,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    Command(CommandSample),
    Response(ResponseSample),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stream", rename_all = "snake_case")]
pub enum WireMessage {
    Command { force: [f64; 3] },
    Response { subject: String, value: f64 },
}

impl WireMessage {
    pub fn drawbar_pull(force_x: f64) -> Self {
        WireMessage::Command {
            force: [force_x, 0.0, 0.0],
        }
    }

    pub fn write_line<W: Write>(&self, out: &mut W) -> Result<(), SweepError> {
        serde_json::to_writer(&mut *out, self)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

/// Assigns arrival order to decoded messages in the order they are read.
#[derive(Debug, Default)]
pub struct ArrivalStamper {
    next: u64,
}

impl ArrivalStamper {
    pub fn stamp(&mut self, message: WireMessage) -> TelemetryEvent {
        let arrival_order = self.next;
        self.next += 1;
        match message {
            WireMessage::Command { force } => TelemetryEvent::Command(CommandSample {
                force,
                arrival_order,
            }),
            WireMessage::Response { subject, value } => TelemetryEvent::Response(ResponseSample {
                subject,
                value,
                arrival_order,
            }),
        }
    }

    pub fn decode_line(&mut self, line: &str) -> Result<Option<TelemetryEvent>, SweepError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        let message: WireMessage = serde_json::from_str(trimmed)?;
        Ok(Some(self.stamp(message)))
    }
}

/// Decodes `reader` line by line onto `tx` from a dedicated thread.
///
/// Returns the number of events forwarded once the input ends or the
/// receiving side goes away. Malformed lines are logged and skipped.
pub fn spawn_line_reader<R>(reader: R, tx: Sender<TelemetryEvent>) -> JoinHandle<u64>
where
    R: BufRead + Send + 'static,
{
    thread::spawn(move || {
        let mut stamper = ArrivalStamper::default();
        let mut forwarded = 0_u64;
        for (line_no, line) in reader.lines().enumerate() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    warn!("telemetry input closed: {err}");
                    break;
                }
            };
            match stamper.decode_line(&line) {
                Ok(Some(event)) => {
                    if tx.send(event).is_err() {
                        debug!("aggregation task gone, stopping reader");
                        break;
                    }
                    forwarded += 1;
                }
                Ok(None) => {}
                Err(err) => warn!(line = line_no + 1, "skipping malformed telemetry: {err}"),
            }
        }
        forwarded
    })
}
