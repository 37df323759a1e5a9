//! Read-only pseudo-media that replays `candump -L` log files
//!
//! Useful for postmortem analysis of a Cyphal/CAN network from the standard can-utils log
//! format:
//!
//! ```text
//! (1657800496.359233) slcan0 0C60647D#020000FB
//! (1657800496.360136) slcan0 10606E7D#00000000000000BB
//! ```
//!
//! If the dump contains frames from multiple interfaces, only the interface of the first valid
//! record is replayed; filter the log with grep to pick another one. Frame timestamps come from
//! the log, not from the wall clock. When the log runs out the media reports closure, which the
//! owning transport surfaces to the application through its closed flag.

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::time::Instant;

use eyre::WrapErr;

use cygnet_core::Timestamp;

use super::{
    DataFrame, Envelope, FilterConfiguration, FrameFormat, Media, MediaEvent, RxHandler,
    VALID_DATA_LENGTHS,
};

/// How many records are handed to the receive handler per batch
const BATCH_SIZE: usize = 64;

/// One parsed candump log record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Log timestamp in nanoseconds since the epoch; parsed exactly, floats would round
    pub timestamp_ns: u64,
    pub interface: String,
    pub frame: DataFrame,
}

/// Parse `<seconds>.<fraction>` into nanoseconds without going through a float
fn parse_timestamp_ns(text: &str) -> eyre::Result<u64> {
    let (seconds, fraction) = text.split_once('.').unwrap_or((text, ""));
    let seconds: u64 = seconds.parse().wrap_err("Failed to parse seconds")?;
    if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        eyre::bail!("Invalid fractional seconds: {text:?}");
    }
    let mut nanos: u64 = 0;
    if !fraction.is_empty() {
        nanos = fraction.parse::<u64>().wrap_err("Failed to parse fraction")?;
        nanos *= 10u64.pow(9 - fraction.len() as u32);
    }
    Ok(seconds * 1_000_000_000 + nanos)
}

impl Record {
    /// Parse one log line; remote frames (`#R`) and otherwise unsupported records yield `None`
    pub fn parse(line: &str) -> eyre::Result<Option<Record>> {
        let mut parts = line.split_ascii_whitespace();
        let Some(maybe_timestamp) = parts.next() else {
            eyre::bail!("Line {line:?} empty");
        };
        let maybe_timestamp = maybe_timestamp
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .unwrap_or(maybe_timestamp);
        let timestamp_ns = parse_timestamp_ns(maybe_timestamp)?;
        let Some(interface) = parts.next() else {
            eyre::bail!("Failed to parse interface from: {line:?}");
        };
        let Some(maybe_frame) = parts.next() else {
            eyre::bail!("Failed to parse frame data from: {line:?}");
        };
        let Some((maybe_canid, maybe_data)) = maybe_frame.split_once('#') else {
            eyre::bail!("Failed to parse canid from: {maybe_frame:?} in line {line:?}");
        };
        if maybe_data.starts_with('R') || maybe_data.starts_with('#') {
            // Remote frames and CAN FD records with flags are not Cyphal traffic
            return Ok(None);
        }
        let canid =
            u32::from_str_radix(maybe_canid, 16).wrap_err("Failed to parse canid as u32")?;
        // candump prints 8 hex digits for extended identifiers and at most 3 for base ones
        let format = if maybe_canid.len() > 3 {
            FrameFormat::Extended
        } else {
            FrameFormat::Base
        };
        let data = hex::decode(maybe_data).wrap_err("Failed to parse frame data as hex")?;
        if !VALID_DATA_LENGTHS.contains(&data.len()) {
            eyre::bail!("Data length {} is not DLC-representable", data.len());
        }
        let frame = DataFrame::new(format, canid, data)?;
        Ok(Some(Record {
            timestamp_ns,
            interface: interface.to_string(),
            frame,
        }))
    }
}

pub struct CandumpMedia {
    name: String,
    reader: Option<Box<dyn Read + Send>>,
    thread: Option<std::thread::JoinHandle<()>>,
    running: std::sync::Arc<std::sync::atomic::AtomicBool>,
    mtu: usize,
}

impl CandumpMedia {
    pub fn open<P: AsRef<Path>>(path: P) -> eyre::Result<Self> {
        let path = path.as_ref();
        let file =
            File::open(path).wrap_err(format!("Failed to open candump log: {path:?}"))?;
        Ok(Self::from_reader(
            format!("candump:{}", path.display()),
            Box::new(file),
        ))
    }

    /// Replay from any byte stream; handy for tests
    pub fn from_reader(name: String, reader: Box<dyn Read + Send>) -> Self {
        Self {
            name,
            reader: Some(reader),
            thread: None,
            running: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true)),
            mtu: 64,
        }
    }
}

impl Media for CandumpMedia {
    fn interface_name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn number_of_acceptance_filters(&self) -> usize {
        1
    }

    fn start(&mut self, mut handler: RxHandler) -> eyre::Result<()> {
        let Some(reader) = self.reader.take() else {
            eyre::bail!("The candump replay was already started");
        };
        let name = self.name.clone();
        let running = std::sync::Arc::clone(&self.running);
        let thread = std::thread::Builder::new()
            .name(format!("candump_replay_{name}"))
            .spawn(move || {
                let mut replayed_interface: Option<String> = None;
                let mut batch: Vec<(Timestamp, Envelope)> = Vec::with_capacity(BATCH_SIZE);
                for line in BufReader::new(reader).lines() {
                    if !running.load(std::sync::atomic::Ordering::SeqCst) {
                        return;
                    }
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::error!("{name}: failed to read log line: {e}");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let record = match Record::parse(&line) {
                        Ok(Some(record)) => record,
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::debug!("{name}: skipping unparseable record: {e}");
                            continue;
                        }
                    };
                    // Frames from only one interface are replayed; the first valid record
                    // decides which
                    let interface =
                        replayed_interface.get_or_insert_with(|| record.interface.clone());
                    if *interface != record.interface {
                        continue;
                    }
                    let timestamp = Timestamp::new(record.timestamp_ns, record.timestamp_ns);
                    batch.push((
                        timestamp,
                        Envelope {
                            frame: record.frame,
                            loopback: false,
                        },
                    ));
                    if batch.len() >= BATCH_SIZE {
                        handler(MediaEvent::Frames(std::mem::take(&mut batch)));
                    }
                }
                if !batch.is_empty() {
                    handler(MediaEvent::Frames(batch));
                }
                tracing::info!("{name}: log replay finished");
                handler(MediaEvent::Closed);
            })
            .wrap_err("Failed to spawn the candump replay thread")?;
        self.thread = Some(thread);
        Ok(())
    }

    fn configure_acceptance_filters(&mut self, _filters: &[FilterConfiguration]) -> eyre::Result<()> {
        // Replay ignores filtering; every logged frame is delivered
        Ok(())
    }

    fn send(&mut self, _envelopes: &[Envelope], _deadline: Instant) -> eyre::Result<usize> {
        eyre::bail!("{} is a read-only media; transmission is not possible", self.name)
    }

    fn close(&mut self) {
        self.reader = None;
        self.running
            .store(false, std::sync::atomic::Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
