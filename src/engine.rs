use etherparse::{IpNumber, Ipv4HeaderSlice, TcpHeaderSlice};
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// The two IPv4 transport layers a callout can attach to.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Layer {
    InboundTransport,
    OutboundTransport,
}

impl Layer {
    /// Slot of a field within this layer's fixed-value table. The two
    /// layers carry the same schema in different slot orders.
    fn field_index(self, field: Field) -> usize {
        match self {
            Layer::InboundTransport => match field {
                Field::IpProtocol => 0,
                Field::IpRemoteAddress => 1,
                Field::IpRemotePort => 2,
                Field::IpLocalAddress => 3,
                Field::IpLocalPort => 4,
            },
            Layer::OutboundTransport => match field {
                Field::IpProtocol => 0,
                Field::IpLocalAddress => 1,
                Field::IpLocalPort => 2,
                Field::IpRemoteAddress => 3,
                Field::IpRemotePort => 4,
            },
        }
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layer::InboundTransport => write!(f, "inbound"),
            Layer::OutboundTransport => write!(f, "outbound"),
        }
    }
}

/// Fields of the transport-layer metadata schema.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum Field {
    IpProtocol,
    IpLocalAddress,
    IpLocalPort,
    IpRemoteAddress,
    IpRemotePort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Value {
    U8(u8),
    U16(u16),
    U32(u32),
}

const FIXED_VALUE_SLOTS: usize = 5;

/// The fixed-field values the engine supplies to a classification call,
/// laid out per the invoking layer's slot table.
#[derive(Debug, Clone)]
pub struct FixedValues {
    layer: Layer,
    values: [Option<Value>; FIXED_VALUE_SLOTS],
}

impl FixedValues {
    pub fn new(layer: Layer) -> Self {
        FixedValues {
            layer,
            values: [None; FIXED_VALUE_SLOTS],
        }
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn set(&mut self, field: Field, value: Value) {
        self.values[self.layer.field_index(field)] = Some(value);
    }

    pub fn value(&self, field: Field) -> Option<Value> {
        self.values[self.layer.field_index(field)]
    }

    pub fn u8(&self, field: Field) -> Option<u8> {
        match self.value(field) {
            Some(Value::U8(v)) => Some(v),
            _ => None,
        }
    }

    pub fn u16(&self, field: Field) -> Option<u16> {
        match self.value(field) {
            Some(Value::U16(v)) => Some(v),
            _ => None,
        }
    }

    pub fn u32(&self, field: Field) -> Option<u32> {
        match self.value(field) {
            Some(Value::U32(v)) => Some(v),
            _ => None,
        }
    }
}

/// The variable metadata values; `transport_header_size` is only present
/// when the invoking layer declared it.
#[derive(Debug, Clone, Copy, Default)]
pub struct Metadata {
    pub transport_header_size: Option<usize>,
}

/// A possibly non-contiguous packet buffer handed to a classification
/// call. The bytes start at the transport header.
pub trait PacketBuffer {
    /// Total length of header plus payload.
    fn data_length(&self) -> usize;

    /// Yields `len` contiguous bytes, either as a direct view when the
    /// underlying representation is already contiguous, or linearized
    /// into `storage`. `None` when the bytes cannot be produced.
    fn contiguous<'a>(&'a self, len: usize, storage: &'a mut [u8]) -> Option<&'a [u8]>;
}

/// A packet that is already one flat run of bytes.
pub struct SliceBuffer<'p> {
    bytes: &'p [u8],
}

impl<'p> SliceBuffer<'p> {
    pub fn new(bytes: &'p [u8]) -> Self {
        SliceBuffer { bytes }
    }
}

impl PacketBuffer for SliceBuffer<'_> {
    fn data_length(&self) -> usize {
        self.bytes.len()
    }

    fn contiguous<'a>(&'a self, len: usize, _storage: &'a mut [u8]) -> Option<&'a [u8]> {
        if len <= self.bytes.len() {
            Some(&self.bytes[..len])
        } else {
            None
        }
    }
}

/// A packet scattered across a chain of fragments, as a scatter-gather
/// capable stack would hand it over.
pub struct ChainedBuffer {
    fragments: Vec<Vec<u8>>,
}

impl ChainedBuffer {
    pub fn new(fragments: Vec<Vec<u8>>) -> Self {
        ChainedBuffer { fragments }
    }
}

impl PacketBuffer for ChainedBuffer {
    fn data_length(&self) -> usize {
        self.fragments.iter().map(Vec::len).sum()
    }

    fn contiguous<'a>(&'a self, len: usize, storage: &'a mut [u8]) -> Option<&'a [u8]> {
        if len > self.data_length() || storage.len() < len {
            return None;
        }
        let mut written = 0;
        for fragment in &self.fragments {
            if written == len {
                break;
            }
            let take = fragment.len().min(len - written);
            storage[written..written + take].copy_from_slice(&fragment[..take]);
            written += take;
        }
        Some(&storage[..len])
    }
}

/// The pass/fail decision a classification call makes for one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Permit,
    Block,
}

/// Output slot for the classification decision. The engine treats an
/// unset slot as Permit so the data path can never stall.
#[derive(Debug, Default)]
pub struct ClassifyOut {
    action: Option<Action>,
}

impl ClassifyOut {
    pub fn permit(&mut self) {
        self.action = Some(Action::Permit);
    }

    pub fn block(&mut self) {
        self.action = Some(Action::Block);
    }

    pub fn action(&self) -> Option<Action> {
        self.action
    }
}

/// Runtime identity the engine assigns to a registered callout.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct CalloutId(pub u32);

impl fmt::Display for CalloutId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Runtime identity the engine assigns to an installed filter.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct FilterId(pub u64);

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle events delivered to a callout's notify callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalloutEvent {
    FilterAdded(FilterId),
    FilterDeleted(FilterId),
}

/// The three callbacks a callout registers with the engine.
pub trait Callout: Send + Sync {
    /// Invoked once per packet that matched a filter targeting this
    /// callout. Must set an action before returning.
    fn classify(
        &self,
        fixed: &FixedValues,
        meta: &Metadata,
        layer_data: Option<&dyn PacketBuffer>,
        out: &mut ClassifyOut,
    );

    /// Invoked when a filter targeting this callout is added or deleted.
    fn notify(&self, event: CalloutEvent) -> Result<(), EngineError>;

    /// Invoked when a flow routed through this callout is torn down.
    fn flow_delete(&self, layer: Layer, callout: CalloutId, flow_context: u64);
}

/// Registration record: the identifying key plus the callback bundle.
pub struct CalloutRegistration {
    pub key: &'static str,
    pub callout: Arc<dyn Callout>,
}

/// Entry added to the engine's active configuration, binding a key to a
/// registered callout at one layer.
pub struct CalloutConfig {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub layer: Layer,
    pub callout: CalloutId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
}

/// One predicate over a fixed-field value. All conditions of a filter
/// must hold for the filter to match.
#[derive(Debug, Clone, Copy)]
pub struct FilterCondition {
    pub field: Field,
    pub op: MatchOp,
    pub value: Value,
}

impl FilterCondition {
    fn holds(&self, fixed: &FixedValues) -> bool {
        match self.op {
            MatchOp::Equal => fixed.value(self.field) == Some(self.value),
        }
    }
}

/// What happens to a packet once a filter matches it.
#[derive(Debug, Clone, Copy)]
pub enum FilterAction {
    /// Route the packet to the named callout; its decision is final.
    CalloutTerminating(&'static str),
}

/// A filter submitted to the engine.
pub struct FilterSpec {
    pub key: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub layer: Layer,
    /// Priority among co-installed filters; higher binds first.
    pub weight: u8,
    pub conditions: Vec<FilterCondition>,
    pub action: FilterAction,
}

impl FilterSpec {
    fn matches(&self, fixed: &FixedValues) -> bool {
        self.conditions.iter().all(|c| c.holds(fixed))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("callout key {0:?} is already registered")]
    DuplicateCalloutKey(&'static str),
    #[error("callout key {0:?} already has a configuration entry")]
    DuplicateCalloutConfig(&'static str),
    #[error("no registered callout with id {0}")]
    UnknownCalloutId(CalloutId),
    #[error("no configuration entry for callout key {0:?}")]
    UnknownCalloutKey(&'static str),
    #[error("no installed filter with id {0}")]
    UnknownFilterId(FilterId),
    #[error("filter action references callout key {0:?}, which is not configured")]
    UnconfiguredCalloutAction(&'static str),
}

/// The host filtering engine boundary: callout registration, the active
/// configuration, and filter installation.
pub trait FilterEngine {
    fn register_callout(&self, registration: CalloutRegistration) -> Result<CalloutId, EngineError>;
    fn unregister_callout(&self, id: CalloutId) -> Result<(), EngineError>;
    fn add_callout(&self, config: CalloutConfig) -> Result<(), EngineError>;
    fn remove_callout(&self, key: &'static str) -> Result<(), EngineError>;
    fn add_filter(&self, spec: FilterSpec) -> Result<FilterId, EngineError>;
    fn remove_filter(&self, id: FilterId) -> Result<(), EngineError>;
}

struct RegisteredCallout {
    key: &'static str,
    callout: Arc<dyn Callout>,
}

struct ConfigEntry {
    layer: Layer,
    callout: CalloutId,
}

struct InstalledFilter {
    spec: FilterSpec,
}

#[derive(Default)]
struct EngineState {
    callouts: HashMap<CalloutId, RegisteredCallout>,
    config: HashMap<&'static str, ConfigEntry>,
    filters: HashMap<FilterId, InstalledFilter>,
}

/// An in-process filter engine. Holds registered callouts, the active
/// configuration, and installed filters, and dispatches raw IPv4 frames
/// through them.
#[derive(Default)]
pub struct InProcessEngine {
    state: Mutex<EngineState>,
    next_callout: AtomicU32,
    next_filter: AtomicU64,
}

impl InProcessEngine {
    pub fn new() -> Self {
        InProcessEngine::default()
    }

    /// Runs one raw IPv4 frame through the filters installed at `layer`
    /// and returns the resulting action. Frames the transport layer
    /// would never see (non-IPv4, non-TCP, truncated) pass through
    /// without filter evaluation.
    pub fn dispatch(&self, layer: Layer, frame: &[u8]) -> Action {
        let ip = match Ipv4HeaderSlice::from_slice(frame) {
            Ok(ip) => ip,
            Err(e) => {
                debug!("ignoring frame. len:{} err:{}", frame.len(), e);
                return Action::Permit;
            }
        };
        if ip.protocol() != IpNumber::TCP {
            return Action::Permit;
        }
        let segment = &frame[ip.slice().len()..];
        let tcp = match TcpHeaderSlice::from_slice(segment) {
            Ok(tcp) => tcp,
            Err(e) => {
                debug!("ignoring segment. len:{} err:{}", segment.len(), e);
                return Action::Permit;
            }
        };

        // Local/remote are relative to the direction the layer models:
        // inbound packets arrive at the local endpoint, outbound packets
        // leave it.
        let (local, remote) = match layer {
            Layer::InboundTransport => (
                (ip.destination_addr(), tcp.destination_port()),
                (ip.source_addr(), tcp.source_port()),
            ),
            Layer::OutboundTransport => (
                (ip.source_addr(), tcp.source_port()),
                (ip.destination_addr(), tcp.destination_port()),
            ),
        };

        let mut fixed = FixedValues::new(layer);
        fixed.set(Field::IpProtocol, Value::U8(IpNumber::TCP.0));
        fixed.set(Field::IpLocalAddress, Value::U32(u32::from(local.0)));
        fixed.set(Field::IpLocalPort, Value::U16(local.1));
        fixed.set(Field::IpRemoteAddress, Value::U32(u32::from(remote.0)));
        fixed.set(Field::IpRemotePort, Value::U16(remote.1));

        let meta = Metadata {
            transport_header_size: Some(tcp.slice().len()),
        };
        let buffer = SliceBuffer::new(segment);
        self.classify_matching(layer, &fixed, &meta, &buffer)
    }

    fn classify_matching(
        &self,
        layer: Layer,
        fixed: &FixedValues,
        meta: &Metadata,
        buffer: &dyn PacketBuffer,
    ) -> Action {
        // Resolve the target callout under the lock, then release it
        // before invoking classify.
        let callout = {
            let state = self.state.lock().unwrap();
            let mut matching: Vec<&InstalledFilter> = state
                .filters
                .values()
                .filter(|f| f.spec.layer == layer && f.spec.matches(fixed))
                .collect();
            matching.sort_by(|a, b| b.spec.weight.cmp(&a.spec.weight));
            let Some(filter) = matching.first() else {
                return Action::Permit;
            };
            let FilterAction::CalloutTerminating(key) = filter.spec.action;
            let Some(entry) = state.config.get(key) else {
                return Action::Permit;
            };
            // A configured but unregistered callout means teardown is in
            // progress; the packet passes untouched.
            let Some(registered) = state.callouts.get(&entry.callout) else {
                return Action::Permit;
            };
            Arc::clone(&registered.callout)
        };

        let mut out = ClassifyOut::default();
        callout.classify(fixed, meta, Some(buffer), &mut out);
        out.action().unwrap_or(Action::Permit)
    }

    fn callout_for_action(state: &EngineState, action: FilterAction) -> Option<Arc<dyn Callout>> {
        let FilterAction::CalloutTerminating(key) = action;
        let entry = state.config.get(key)?;
        let registered = state.callouts.get(&entry.callout)?;
        Some(Arc::clone(&registered.callout))
    }
}

impl FilterEngine for InProcessEngine {
    fn register_callout(&self, registration: CalloutRegistration) -> Result<CalloutId, EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.callouts.values().any(|c| c.key == registration.key) {
            return Err(EngineError::DuplicateCalloutKey(registration.key));
        }
        let id = CalloutId(self.next_callout.fetch_add(1, Ordering::Relaxed) + 1);
        state.callouts.insert(
            id,
            RegisteredCallout {
                key: registration.key,
                callout: registration.callout,
            },
        );
        Ok(id)
    }

    fn unregister_callout(&self, id: CalloutId) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state
            .callouts
            .remove(&id)
            .map(|_| ())
            .ok_or(EngineError::UnknownCalloutId(id))
    }

    fn add_callout(&self, config: CalloutConfig) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        if state.config.contains_key(config.key) {
            return Err(EngineError::DuplicateCalloutConfig(config.key));
        }
        if !state.callouts.contains_key(&config.callout) {
            return Err(EngineError::UnknownCalloutId(config.callout));
        }
        state.config.insert(
            config.key,
            ConfigEntry {
                layer: config.layer,
                callout: config.callout,
            },
        );
        Ok(())
    }

    fn remove_callout(&self, key: &'static str) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        state
            .config
            .remove(key)
            .map(|_| ())
            .ok_or(EngineError::UnknownCalloutKey(key))
    }

    fn add_filter(&self, spec: FilterSpec) -> Result<FilterId, EngineError> {
        let mut state = self.state.lock().unwrap();
        let FilterAction::CalloutTerminating(key) = spec.action;
        if !state.config.contains_key(key) {
            return Err(EngineError::UnconfiguredCalloutAction(key));
        }
        let id = FilterId(self.next_filter.fetch_add(1, Ordering::Relaxed) + 1);
        if let Some(callout) = Self::callout_for_action(&state, spec.action) {
            callout.notify(CalloutEvent::FilterAdded(id))?;
        }
        state.filters.insert(id, InstalledFilter { spec });
        Ok(id)
    }

    fn remove_filter(&self, id: FilterId) -> Result<(), EngineError> {
        let mut state = self.state.lock().unwrap();
        let installed = state
            .filters
            .remove(&id)
            .ok_or(EngineError::UnknownFilterId(id))?;
        if let Some(callout) = Self::callout_for_action(&state, installed.spec.action) {
            // Deletion of the filter stands even if the callout objects.
            let _ = callout.notify(CalloutEvent::FilterDeleted(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingCallout {
        classified: AtomicUsize,
        notified: AtomicUsize,
    }

    impl CountingCallout {
        fn new() -> Arc<Self> {
            Arc::new(CountingCallout {
                classified: AtomicUsize::new(0),
                notified: AtomicUsize::new(0),
            })
        }
    }

    impl Callout for CountingCallout {
        fn classify(
            &self,
            _fixed: &FixedValues,
            _meta: &Metadata,
            _layer_data: Option<&dyn PacketBuffer>,
            out: &mut ClassifyOut,
        ) {
            self.classified.fetch_add(1, Ordering::Relaxed);
            out.permit();
        }

        fn notify(&self, _event: CalloutEvent) -> Result<(), EngineError> {
            self.notified.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn flow_delete(&self, _layer: Layer, _callout: CalloutId, _flow_context: u64) {}
    }

    fn configured_engine(key: &'static str) -> (InProcessEngine, Arc<CountingCallout>, CalloutId) {
        let engine = InProcessEngine::new();
        let callout = CountingCallout::new();
        let id = engine
            .register_callout(CalloutRegistration {
                key,
                callout: callout.clone(),
            })
            .unwrap();
        engine
            .add_callout(CalloutConfig {
                key,
                name: "test callout",
                description: "test",
                layer: Layer::OutboundTransport,
                callout: id,
            })
            .unwrap();
        (engine, callout, id)
    }

    fn port_filter(callout_key: &'static str, weight: u8, port: u16) -> FilterSpec {
        FilterSpec {
            key: "test.filter",
            name: "test filter",
            description: "test",
            layer: Layer::OutboundTransport,
            weight,
            conditions: vec![
                FilterCondition {
                    field: Field::IpProtocol,
                    op: MatchOp::Equal,
                    value: Value::U8(IpNumber::TCP.0),
                },
                FilterCondition {
                    field: Field::IpRemotePort,
                    op: MatchOp::Equal,
                    value: Value::U16(port),
                },
            ],
            action: FilterAction::CalloutTerminating(callout_key),
        }
    }

    fn outbound_fixed(remote_port: u16) -> FixedValues {
        let mut fixed = FixedValues::new(Layer::OutboundTransport);
        fixed.set(Field::IpProtocol, Value::U8(IpNumber::TCP.0));
        fixed.set(Field::IpLocalAddress, Value::U32(0x0A000005));
        fixed.set(Field::IpLocalPort, Value::U16(51000));
        fixed.set(Field::IpRemoteAddress, Value::U32(0x5DB8D822));
        fixed.set(Field::IpRemotePort, Value::U16(remote_port));
        fixed
    }

    #[test]
    fn layers_use_distinct_slot_tables() {
        let inbound = Layer::InboundTransport;
        let outbound = Layer::OutboundTransport;
        assert_ne!(
            inbound.field_index(Field::IpLocalPort),
            outbound.field_index(Field::IpLocalPort)
        );
        // Either table is a permutation of all five slots.
        for layer in [inbound, outbound] {
            let mut slots: Vec<_> = [
                Field::IpProtocol,
                Field::IpLocalAddress,
                Field::IpLocalPort,
                Field::IpRemoteAddress,
                Field::IpRemotePort,
            ]
            .iter()
            .map(|f| layer.field_index(*f))
            .collect();
            slots.sort_unstable();
            assert_eq!(slots, vec![0, 1, 2, 3, 4]);
        }
    }

    #[test]
    fn fixed_values_round_trip_through_layer_table() {
        let fixed = outbound_fixed(25565);
        assert_eq!(fixed.u16(Field::IpRemotePort), Some(25565));
        assert_eq!(fixed.u32(Field::IpLocalAddress), Some(0x0A000005));
        assert_eq!(fixed.u8(Field::IpProtocol), Some(6));
        // Type-mismatched reads come back empty.
        assert_eq!(fixed.u8(Field::IpRemotePort), None);
    }

    #[test]
    fn duplicate_registration_key_rejected() {
        let (engine, callout, _) = configured_engine("k");
        let err = engine
            .register_callout(CalloutRegistration {
                key: "k",
                callout: callout.clone(),
            })
            .unwrap_err();
        assert_eq!(err, EngineError::DuplicateCalloutKey("k"));
    }

    #[test]
    fn config_entry_requires_registered_callout() {
        let engine = InProcessEngine::new();
        let err = engine
            .add_callout(CalloutConfig {
                key: "k",
                name: "n",
                description: "d",
                layer: Layer::InboundTransport,
                callout: CalloutId(7),
            })
            .unwrap_err();
        assert_eq!(err, EngineError::UnknownCalloutId(CalloutId(7)));
    }

    #[test]
    fn filter_requires_configured_callout() {
        let engine = InProcessEngine::new();
        let err = engine.add_filter(port_filter("missing", 0xF, 25565)).unwrap_err();
        assert_eq!(err, EngineError::UnconfiguredCalloutAction("missing"));
    }

    #[test]
    fn filter_add_and_delete_notify_the_callout() {
        let (engine, callout, _) = configured_engine("k");
        let id = engine.add_filter(port_filter("k", 0xF, 25565)).unwrap();
        assert_eq!(callout.notified.load(Ordering::Relaxed), 1);
        engine.remove_filter(id).unwrap();
        assert_eq!(callout.notified.load(Ordering::Relaxed), 2);
        assert_eq!(
            engine.remove_filter(id).unwrap_err(),
            EngineError::UnknownFilterId(id)
        );
    }

    #[test]
    fn matching_filter_invokes_classify() {
        let (engine, callout, _) = configured_engine("k");
        engine.add_filter(port_filter("k", 0xF, 25565)).unwrap();
        let fixed = outbound_fixed(25565);
        let meta = Metadata {
            transport_header_size: Some(20),
        };
        let buffer = SliceBuffer::new(&[0u8; 20]);
        let action = engine.classify_matching(Layer::OutboundTransport, &fixed, &meta, &buffer);
        assert_eq!(action, Action::Permit);
        assert_eq!(callout.classified.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn non_matching_port_skips_classify() {
        let (engine, callout, _) = configured_engine("k");
        engine.add_filter(port_filter("k", 0xF, 25565)).unwrap();
        let fixed = outbound_fixed(80);
        let meta = Metadata {
            transport_header_size: Some(20),
        };
        let buffer = SliceBuffer::new(&[0u8; 20]);
        let action = engine.classify_matching(Layer::OutboundTransport, &fixed, &meta, &buffer);
        assert_eq!(action, Action::Permit);
        assert_eq!(callout.classified.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn unregistered_callout_permits_without_classify() {
        let (engine, callout, id) = configured_engine("k");
        engine.add_filter(port_filter("k", 0xF, 25565)).unwrap();
        engine.unregister_callout(id).unwrap();
        let fixed = outbound_fixed(25565);
        let meta = Metadata::default();
        let buffer = SliceBuffer::new(&[0u8; 20]);
        let action = engine.classify_matching(Layer::OutboundTransport, &fixed, &meta, &buffer);
        assert_eq!(action, Action::Permit);
        assert_eq!(callout.classified.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn heavier_filter_binds_first() {
        let engine = InProcessEngine::new();
        let heavy = CountingCallout::new();
        let light = CountingCallout::new();
        for (key, callout) in [("heavy", heavy.clone()), ("light", light.clone())] {
            let id = engine
                .register_callout(CalloutRegistration {
                    key,
                    callout,
                })
                .unwrap();
            engine
                .add_callout(CalloutConfig {
                    key,
                    name: "n",
                    description: "d",
                    layer: Layer::OutboundTransport,
                    callout: id,
                })
                .unwrap();
        }
        engine.add_filter(port_filter("light", 0x1, 25565)).unwrap();
        engine.add_filter(port_filter("heavy", 0xF, 25565)).unwrap();

        let fixed = outbound_fixed(25565);
        let meta = Metadata::default();
        let buffer = SliceBuffer::new(&[0u8; 20]);
        engine.classify_matching(Layer::OutboundTransport, &fixed, &meta, &buffer);
        assert_eq!(heavy.classified.load(Ordering::Relaxed), 1);
        assert_eq!(light.classified.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn chained_buffer_linearizes_in_order() {
        let buffer = ChainedBuffer::new(vec![vec![1, 2, 3], vec![], vec![4, 5], vec![6]]);
        assert_eq!(buffer.data_length(), 6);
        let mut storage = [0u8; 6];
        let view = buffer.contiguous(6, &mut storage).unwrap();
        assert_eq!(view, &[1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn chained_buffer_partial_and_failing_reads() {
        let buffer = ChainedBuffer::new(vec![vec![1, 2], vec![3, 4]]);
        let mut storage = [0u8; 4];
        assert_eq!(buffer.contiguous(3, &mut storage).unwrap(), &[1, 2, 3]);
        // More bytes than the chain holds.
        assert!(buffer.contiguous(5, &mut storage).is_none());
        // Storage too small to linearize into.
        let mut small = [0u8; 2];
        assert!(buffer.contiguous(4, &mut small).is_none());
    }
}
