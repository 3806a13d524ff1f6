//! Transport-layer metrics.

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

lazy_static! {
    /// Envelopes dropped before delivery (malformed, unknown session, overflow).
    pub static ref DROPPED_ENVELOPES: IntCounterVec = register_int_counter_vec!(
        "tss_dropped_envelopes_total",
        "Inbound envelopes dropped before delivery",
        &["reason"]
    )
    .expect("failed to register tss_dropped_envelopes_total");

    /// Peers marked unresponsive within a session.
    pub static ref UNRESPONSIVE_PEERS: IntCounter = register_int_counter!(
        "tss_unresponsive_peers_total",
        "Peers marked unresponsive after a failed retry"
    )
    .expect("failed to register tss_unresponsive_peers_total");

    /// Outbound send retries after a transient transport error.
    pub static ref SEND_RETRIES: IntCounter = register_int_counter!(
        "tss_send_retries_total",
        "Outbound envelope retries after transient failure"
    )
    .expect("failed to register tss_send_retries_total");
}
