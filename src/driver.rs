use etherparse::IpNumber;
use log::error;
use std::sync::Arc;

use crate::callout::{DiagnosticSink, TransportCallout};
use crate::engine::{
    CalloutConfig, CalloutId, CalloutRegistration, EngineError, Field, FilterAction,
    FilterCondition, FilterEngine, FilterId, FilterSpec, Layer, MatchOp, Value,
};

/// Remote TCP port the observer watches.
pub const MONITOR_PORT: u16 = 25565;

/// Priority of the observer's filters among co-installed filters.
const FILTER_WEIGHT: u8 = 0xF;

fn callout_key(layer: Layer) -> &'static str {
    match layer {
        Layer::InboundTransport => "ttap.callout.inbound",
        Layer::OutboundTransport => "ttap.callout.outbound",
    }
}

fn callout_name(layer: Layer) -> &'static str {
    match layer {
        Layer::InboundTransport => "ttap inbound transport callout",
        Layer::OutboundTransport => "ttap outbound transport callout",
    }
}

fn filter_key(layer: Layer) -> &'static str {
    match layer {
        Layer::InboundTransport => "ttap.filter.inbound",
        Layer::OutboundTransport => "ttap.filter.outbound",
    }
}

fn filter_name(layer: Layer) -> &'static str {
    match layer {
        Layer::InboundTransport => "ttap inbound transport filter",
        Layer::OutboundTransport => "ttap outbound transport filter",
    }
}

/// Runtime identities of the two callouts and two filters, written once
/// at create time and taken once at delete time. Owned by whoever
/// sequences start and stop; create and delete calls are expected not
/// to overlap.
#[derive(Debug, Default)]
pub struct DriverState {
    inbound_callout: Option<CalloutId>,
    outbound_callout: Option<CalloutId>,
    inbound_filter: Option<FilterId>,
    outbound_filter: Option<FilterId>,
}

impl DriverState {
    pub fn callout_id(&self, layer: Layer) -> Option<CalloutId> {
        match layer {
            Layer::InboundTransport => self.inbound_callout,
            Layer::OutboundTransport => self.outbound_callout,
        }
    }

    pub fn filter_id(&self, layer: Layer) -> Option<FilterId> {
        match layer {
            Layer::InboundTransport => self.inbound_filter,
            Layer::OutboundTransport => self.outbound_filter,
        }
    }

    fn callout_slot(&mut self, layer: Layer) -> &mut Option<CalloutId> {
        match layer {
            Layer::InboundTransport => &mut self.inbound_callout,
            Layer::OutboundTransport => &mut self.outbound_callout,
        }
    }

    fn filter_slot(&mut self, layer: Layer) -> &mut Option<FilterId> {
        match layer {
            Layer::InboundTransport => &mut self.inbound_filter,
            Layer::OutboundTransport => &mut self.outbound_filter,
        }
    }
}

/// Registers the interception point for one direction and adds it to
/// the engine's active configuration.
pub fn create_callout<E: FilterEngine + ?Sized>(
    engine: &E,
    state: &mut DriverState,
    layer: Layer,
    sink: Arc<dyn DiagnosticSink>,
) -> Result<(), EngineError> {
    let key = callout_key(layer);
    let callout = Arc::new(TransportCallout::new(layer, sink));
    let id = match engine.register_callout(CalloutRegistration { key, callout }) {
        Ok(id) => id,
        Err(e) => {
            error!("failed to register {layer} callout: {e}");
            return Err(e);
        }
    };
    *state.callout_slot(layer) = Some(id);

    let config = CalloutConfig {
        key,
        name: callout_name(layer),
        description: "Observes TCP segments and prints a diagnostic record",
        layer,
        callout: id,
    };
    if let Err(e) = engine.add_callout(config) {
        // The registration deliberately stays in place when the
        // configuration step fails.
        error!("failed to add {layer} callout to the engine configuration: {e}");
        return Err(e);
    }
    Ok(())
}

/// Tears down one direction's interception point. Unregistration comes
/// first so the engine cannot invoke a callout that is mid-teardown.
pub fn delete_callout<E: FilterEngine + ?Sized>(
    engine: &E,
    state: &mut DriverState,
    layer: Layer,
) -> Result<(), EngineError> {
    if let Some(id) = state.callout_slot(layer).take() {
        if let Err(e) = engine.unregister_callout(id) {
            error!("failed to unregister {layer} callout: {e}");
            return Err(e);
        }
    }
    if let Err(e) = engine.remove_callout(callout_key(layer)) {
        error!("failed to remove {layer} callout from the engine configuration: {e}");
        return Err(e);
    }
    Ok(())
}

/// Installs one direction's filter: TCP only, remote port
/// `MONITOR_PORT`, terminating at that direction's callout.
pub fn create_filter<E: FilterEngine + ?Sized>(
    engine: &E,
    state: &mut DriverState,
    layer: Layer,
) -> Result<(), EngineError> {
    let spec = FilterSpec {
        key: filter_key(layer),
        name: filter_name(layer),
        description: "Routes TCP segments on the monitored port to the observer",
        layer,
        weight: FILTER_WEIGHT,
        conditions: vec![
            FilterCondition {
                field: Field::IpProtocol,
                op: MatchOp::Equal,
                value: Value::U8(IpNumber::TCP.0),
            },
            FilterCondition {
                field: Field::IpRemotePort,
                op: MatchOp::Equal,
                value: Value::U16(MONITOR_PORT),
            },
        ],
        action: FilterAction::CalloutTerminating(callout_key(layer)),
    };
    match engine.add_filter(spec) {
        Ok(id) => {
            *state.filter_slot(layer) = Some(id);
            Ok(())
        }
        Err(e) => {
            error!("failed to add {layer} filter: {e}");
            Err(e)
        }
    }
}

/// Removes one direction's filter by its stored runtime identity.
pub fn delete_filter<E: FilterEngine + ?Sized>(
    engine: &E,
    state: &mut DriverState,
    layer: Layer,
) -> Result<(), EngineError> {
    let Some(id) = state.filter_slot(layer).take() else {
        return Ok(());
    };
    if let Err(e) = engine.remove_filter(id) {
        error!("failed to delete {layer} filter: {e}");
        return Err(e);
    }
    Ok(())
}

/// Brings up both interception points, then both filters. A filter is
/// only installed once its callout exists.
pub fn start<E: FilterEngine + ?Sized>(
    engine: &E,
    state: &mut DriverState,
    sink: Arc<dyn DiagnosticSink>,
) -> Result<(), EngineError> {
    for layer in [Layer::InboundTransport, Layer::OutboundTransport] {
        create_callout(engine, state, layer, sink.clone())?;
    }
    for layer in [Layer::InboundTransport, Layer::OutboundTransport] {
        create_filter(engine, state, layer)?;
    }
    Ok(())
}

/// Tears everything down in reverse: filters first, then callouts.
pub fn stop<E: FilterEngine + ?Sized>(
    engine: &E,
    state: &mut DriverState,
) -> Result<(), EngineError> {
    for layer in [Layer::InboundTransport, Layer::OutboundTransport] {
        delete_filter(engine, state, layer)?;
    }
    for layer in [Layer::InboundTransport, Layer::OutboundTransport] {
        delete_callout(engine, state, layer)?;
    }
    Ok(())
}
