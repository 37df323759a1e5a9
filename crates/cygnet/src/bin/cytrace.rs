use std::io::{BufRead, BufReader, BufWriter, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use serde::ser::SerializeStruct;

use cygnet::stdio::{get_input_reader, get_output_writer};
use cygnet_can::media::Record;
use cygnet_can::{CanCapture, CanTracer};
use cygnet_core::tracer::{Trace, Tracer};
use cygnet_core::{DataSpecifier, ServiceRole, Timestamp};

/// Reconstruct Cyphal transfers from a candump log
///
/// Reads `candump -L` style records, reassembles the Cyphal/CAN transfers they carry, and prints
/// one line per reconstructed transfer (or reassembly error). Frames that are not Cyphal traffic
/// are skipped; the bus may be shared with other protocols.
#[derive(Debug, Parser)]
#[clap(version, verbatim_doc_comment)]
struct Args {
    #[clap(short, long, default_value_t = tracing::Level::INFO)]
    log_level: tracing::Level,

    /// Emit one JSON object per line instead of the text format
    #[clap(long)]
    json: bool,

    /// Path to the input candump log. stdin if '-' or if not passed
    input: Option<PathBuf>,

    /// Path to the output. stdout if '-' or if not passed
    output: Option<PathBuf>,
}

/// One printable trace event
struct TraceRecord<'a> {
    trace: &'a Trace,
}

fn format_timestamp(timestamp: Timestamp) -> String {
    let ns = timestamp.system_ns();
    format!("{}.{:06}", ns / 1_000_000_000, (ns % 1_000_000_000) / 1_000)
}

fn format_port(data_specifier: DataSpecifier) -> String {
    match data_specifier {
        DataSpecifier::Message { subject_id } => format!("sub:{subject_id}"),
        DataSpecifier::Service {
            service_id,
            role: ServiceRole::Request,
        } => format!("srv:{service_id}:req"),
        DataSpecifier::Service {
            service_id,
            role: ServiceRole::Response,
        } => format!("srv:{service_id}:resp"),
    }
}

fn format_node(node_id: Option<u16>, broadcast: &str) -> String {
    match node_id {
        Some(id) => id.to_string(),
        None => broadcast.to_string(),
    }
}

impl TraceRecord<'_> {
    fn write_text<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        match self.trace {
            Trace::Transfer(transfer) => {
                let specifier = transfer.transfer.metadata.session_specifier;
                let payload =
                    cygnet_core::transfer::concatenate(&transfer.transfer.fragmented_payload);
                writeln!(
                    writer,
                    "({}) {} -> {} {} prio={} tid={} timeout={:.3}s payload[{}]={}",
                    format_timestamp(transfer.timestamp),
                    format_node(specifier.source_node_id, "anon"),
                    format_node(specifier.destination_node_id, "all"),
                    format_port(specifier.data_specifier),
                    u8::from(transfer.transfer.metadata.priority),
                    transfer.transfer.metadata.transfer_id,
                    transfer.transfer_id_timeout.as_secs_f64(),
                    payload.len(),
                    hex::encode(payload),
                )
            }
            Trace::Error(error) => writeln!(
                writer,
                "({}) error: {}",
                format_timestamp(error.timestamp),
                error.error
            ),
            Trace::OutOfBand(oob) => writeln!(
                writer,
                "({}) out-of-band[{}]={}",
                format_timestamp(oob.timestamp),
                oob.data.len(),
                hex::encode(&oob.data)
            ),
        }
    }
}

impl serde::Serialize for TraceRecord<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.trace {
            Trace::Transfer(transfer) => {
                let specifier = transfer.transfer.metadata.session_specifier;
                let payload =
                    cygnet_core::transfer::concatenate(&transfer.transfer.fragmented_payload);
                let mut state = serializer.serialize_struct("TraceRecord", 8)?;
                state.serialize_field("kind", "transfer")?;
                state.serialize_field("timestamp", &format_timestamp(transfer.timestamp))?;
                state.serialize_field("source", &specifier.source_node_id)?;
                state.serialize_field("destination", &specifier.destination_node_id)?;
                state.serialize_field("port", &format_port(specifier.data_specifier))?;
                state.serialize_field(
                    "priority",
                    &u8::from(transfer.transfer.metadata.priority),
                )?;
                state.serialize_field("transfer_id", &transfer.transfer.metadata.transfer_id)?;
                state.serialize_field("payload", &hex::encode(payload))?;
                state.end()
            }
            Trace::Error(error) => {
                let mut state = serializer.serialize_struct("TraceRecord", 3)?;
                state.serialize_field("kind", "error")?;
                state.serialize_field("timestamp", &format_timestamp(error.timestamp))?;
                state.serialize_field("error", &error.error)?;
                state.end()
            }
            Trace::OutOfBand(oob) => {
                let mut state = serializer.serialize_struct("TraceRecord", 3)?;
                state.serialize_field("kind", "out_of_band")?;
                state.serialize_field("timestamp", &format_timestamp(oob.timestamp))?;
                state.serialize_field("data", &hex::encode(&oob.data))?;
                state.end()
            }
        }
    }
}

fn main() -> eyre::Result<()> {
    let use_color = std::io::stderr().is_terminal();
    if use_color {
        color_eyre::install()?;
    }

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(args.log_level.into())
        .with_env_var("CYGNET_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(use_color)
        .with_writer(std::io::stderr)
        .init();

    let input = BufReader::new(get_input_reader(&args.input)?);
    let mut writer = BufWriter::new(get_output_writer(&args.output)?);

    let start = Instant::now();
    let mut tracer = CanTracer::new();
    let mut records = 0usize;
    let mut traces = 0usize;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = match Record::parse(&line) {
            Ok(Some(record)) => record,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Failed to parse record: {e}");
                continue;
            }
        };
        records += 1;
        let capture = CanCapture {
            timestamp: Timestamp::new(record.timestamp_ns, record.timestamp_ns),
            frame: record.frame,
            own: false,
        };
        if let Some(trace) = tracer.update(&capture) {
            traces += 1;
            let record = TraceRecord { trace: &trace };
            if args.json {
                serde_json::to_writer(&mut writer, &record)?;
                writeln!(writer)?;
            } else {
                record.write_text(&mut writer)?;
            }
        }
    }
    writer.flush()?;

    tracing::info!(
        "Processed {records} records into {traces} traces in {:?}",
        start.elapsed()
    );

    Ok(())
}
