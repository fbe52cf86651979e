//! Counters and gauges recorded through the global OpenTelemetry meter.
//!
//! Instruments are built once on first use. Unless the host process
//! installs a meter provider they are no-ops.

use std::sync::OnceLock;

use opentelemetry::metrics::{Counter, Gauge};
use opentelemetry::KeyValue;

use crate::types::Direction;

struct Instruments {
    stanzas: Counter<u64>,
    dropped: Counter<u64>,
    auth: Counter<u64>,
    connections: Gauge<i64>,
}

static INSTRUMENTS: OnceLock<Instruments> = OnceLock::new();

fn instruments() -> &'static Instruments {
    INSTRUMENTS.get_or_init(|| {
        let meter = opentelemetry::global::meter("pebble-xmpp");
        Instruments {
            stanzas: meter
                .u64_counter("xmpp.stanzas.processed")
                .with_description("Stanzas read from or written to clients")
                .with_unit("stanza")
                .build(),
            dropped: meter
                .u64_counter("xmpp.stanzas.dropped")
                .with_description("Stanzas the router could not queue for a recipient")
                .with_unit("stanza")
                .build(),
            auth: meter
                .u64_counter("xmpp.auth.attempts")
                .with_description("SASL exchanges by outcome")
                .with_unit("attempt")
                .build(),
            connections: meter
                .i64_gauge("xmpp.connections.active")
                .with_description("Bound connections in the routing registry")
                .with_unit("connection")
                .build(),
        }
    })
}

/// Count one stanza crossing a client stream.
pub fn record_stanza(kind: &'static str, direction: Direction) {
    instruments().stanzas.add(
        1,
        &[KeyValue::new("type", kind), KeyValue::new("direction", direction.as_str())],
    );
}

/// Count one SASL exchange.
pub fn record_auth_attempt(mechanism: &'static str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    instruments().auth.add(
        1,
        &[KeyValue::new("mechanism", mechanism), KeyValue::new("result", outcome)],
    );
}

/// Count a stanza the router dropped; `reason` is `recipient-offline` or `queue-full`.
pub fn record_stanza_dropped(kind: &'static str, reason: &'static str) {
    instruments()
        .dropped
        .add(1, &[KeyValue::new("type", kind), KeyValue::new("reason", reason)]);
}

/// Record how many connections are currently bound in the registry.
pub fn record_connection_count(count: usize) {
    instruments()
        .connections
        .record(i64::try_from(count).unwrap_or(i64::MAX), &[]);
}
