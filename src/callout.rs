use std::fmt;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use crate::engine::{
    Callout, CalloutEvent, CalloutId, ClassifyOut, EngineError, Field, FixedValues, Layer,
    Metadata, PacketBuffer,
};
use crate::tcp;

/// Local and remote endpoints of one packet, relative to the direction
/// it was intercepted in.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub struct FlowDescriptor {
    pub local: (Ipv4Addr, u16),
    pub remote: (Ipv4Addr, u16),
}

impl FlowDescriptor {
    /// Reads the four endpoint fields out of the fixed values. Which
    /// slots those live in depends on the invoking layer; `FixedValues`
    /// resolves that.
    pub fn from_fixed(fixed: &FixedValues) -> Option<Self> {
        Some(FlowDescriptor {
            local: (
                Ipv4Addr::from(fixed.u32(Field::IpLocalAddress)?),
                fixed.u16(Field::IpLocalPort)?,
            ),
            remote: (
                Ipv4Addr::from(fixed.u32(Field::IpRemoteAddress)?),
                fixed.u16(Field::IpRemotePort)?,
            ),
        })
    }
}

impl fmt::Display for FlowDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.local.0, self.local.1, self.remote.0, self.remote.1
        )
    }
}

/// Line-oriented transport for diagnostic records. Fire-and-forget; the
/// classification path never learns whether a line landed anywhere.
pub trait DiagnosticSink: Send + Sync {
    fn line(&self, args: fmt::Arguments<'_>);
}

/// Sink used by the binary.
pub struct StdoutSink;

impl DiagnosticSink for StdoutSink {
    fn line(&self, args: fmt::Arguments<'_>) {
        println!("{args}");
    }
}

/// Sink that captures lines in memory; handy for inspecting records in
/// tests.
#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }
}

impl DiagnosticSink for MemorySink {
    fn line(&self, args: fmt::Arguments<'_>) {
        self.lines.lock().unwrap().push(args.to_string());
    }
}

/// The per-direction interception point. Purely observational: it
/// renders a diagnostic record for each classified packet and always
/// permits it through.
pub struct TransportCallout {
    layer: Layer,
    sink: Arc<dyn DiagnosticSink>,
}

impl TransportCallout {
    pub fn new(layer: Layer, sink: Arc<dyn DiagnosticSink>) -> Self {
        TransportCallout { layer, sink }
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    /// The inspection body. Every soft failure (missing metadata, no
    /// layer data, allocation or linearization failure, missing fixed
    /// fields) aborts via `None`; the caller permits the packet either
    /// way and nothing is emitted or logged for the aborted record.
    fn inspect(
        &self,
        fixed: &FixedValues,
        meta: &Metadata,
        layer_data: Option<&dyn PacketBuffer>,
    ) -> Option<()> {
        let header_size = meta.transport_header_size?;
        let buffer = layer_data?;

        let flow = FlowDescriptor::from_fixed(fixed)?;
        let packet_length = buffer.data_length();

        // One scratch buffer per invocation, dropped on every path out
        // of this function.
        let mut scratch = Vec::new();
        scratch.try_reserve_exact(packet_length).ok()?;
        scratch.resize(packet_length, 0u8);
        let view = buffer.contiguous(packet_length, &mut scratch)?;

        // At these layers the stack has usually not filled the field in
        // yet, so expect zero.
        let checksum = tcp::checksum(view);
        self.emit_record(&flow, view, header_size, checksum);
        Some(())
    }

    fn emit_record(&self, flow: &FlowDescriptor, view: &[u8], header_size: usize, checksum: u16) {
        let sink = &self.sink;
        sink.line(format_args!("BEGIN PACKET: {:04x}", checksum));
        sink.line(format_args!("Direction: {}", flow));

        let names: Vec<&str> = tcp::flag_names(view).collect();
        sink.line(format_args!("Flags: {}", names.join(" ")));

        if view.len() > header_size {
            sink.line(format_args!("Data:"));
            for value in &view[header_size..] {
                sink.line(format_args!(
                    "({:04}) (0x{:02x}) {}",
                    value,
                    value,
                    tcp::binary_octet(*value)
                ));
            }
        }

        sink.line(format_args!("END PACKET: {:04x}", checksum));
    }
}

impl Callout for TransportCallout {
    fn classify(
        &self,
        fixed: &FixedValues,
        meta: &Metadata,
        layer_data: Option<&dyn PacketBuffer>,
        out: &mut ClassifyOut,
    ) {
        // A failed inspection only costs the diagnostic record; the
        // action is permit on every path.
        let _ = self.inspect(fixed, meta, layer_data);
        out.permit();
    }

    fn notify(&self, _event: CalloutEvent) -> Result<(), EngineError> {
        // No interest in callout events yet.
        Ok(())
    }

    fn flow_delete(&self, _layer: Layer, _callout: CalloutId, _flow_context: u64) {
        // No per-flow state to release.
    }
}
