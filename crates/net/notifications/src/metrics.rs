//! Notification protocol metrics

use metrics::Counter;
use vertex_net_transport::ProtocolName;

/// Counters for one protocol on one backend.
#[derive(Clone, Debug)]
pub struct NotificationMetrics {
    protocol: String,
    backend: &'static str,
    /// Substreams that completed the handshake
    substreams_opened_total: Counter,
    /// Substreams that ended gracefully
    substreams_closed_total: Counter,
    /// Substreams that ended with an error
    substreams_failed_total: Counter,
    notifications_sent_total: Counter,
    notifications_received_total: Counter,
    bytes_sent_total: Counter,
    bytes_received_total: Counter,
    /// Sends abandoned because no credit arrived before the deadline
    backpressure_timeouts_total: Counter,
    handshake_failures_total: Counter,
}

impl NotificationMetrics {
    pub fn new(protocol: &ProtocolName, backend: &'static str) -> Self {
        let protocol = protocol.to_string();
        let labels = [("protocol", protocol.clone()), ("backend", backend.to_string())];

        Self {
            substreams_opened_total: metrics::counter!(
                "notifications_substreams_opened_total",
                &labels
            ),
            substreams_closed_total: metrics::counter!(
                "notifications_substreams_closed_total",
                &labels
            ),
            substreams_failed_total: metrics::counter!(
                "notifications_substreams_failed_total",
                &labels
            ),
            notifications_sent_total: metrics::counter!("notifications_sent_total", &labels),
            notifications_received_total: metrics::counter!(
                "notifications_received_total",
                &labels
            ),
            bytes_sent_total: metrics::counter!("notifications_bytes_sent_total", &labels),
            bytes_received_total: metrics::counter!(
                "notifications_bytes_received_total",
                &labels
            ),
            backpressure_timeouts_total: metrics::counter!(
                "notifications_backpressure_timeouts_total",
                &labels
            ),
            handshake_failures_total: metrics::counter!(
                "notifications_handshake_failures_total",
                &labels
            ),
            protocol,
            backend,
        }
    }

    pub(crate) fn substream_opened(&self) {
        self.substreams_opened_total.increment(1);
    }

    pub(crate) fn substream_closed(&self) {
        self.substreams_closed_total.increment(1);
    }

    pub(crate) fn substream_failed(&self) {
        self.substreams_failed_total.increment(1);
    }

    pub(crate) fn notification_sent(&self, bytes: usize) {
        self.notifications_sent_total.increment(1);
        self.bytes_sent_total.increment(bytes as u64);
    }

    pub(crate) fn notification_received(&self, bytes: usize) {
        self.notifications_received_total.increment(1);
        self.bytes_received_total.increment(bytes as u64);
    }

    pub(crate) fn backpressure_timeout(&self) {
        self.backpressure_timeouts_total.increment(1);
    }

    pub(crate) fn handshake_failure(&self) {
        self.handshake_failures_total.increment(1);
    }

    /// Inbound substream for a protocol that is not registered. There is no
    /// per-protocol counter set to charge, so only the backend is labelled.
    pub(crate) fn unknown_protocol_rejected(backend: &'static str) {
        metrics::counter!(
            "notifications_inbound_rejected_total",
            "backend" => backend,
            "reason" => "unknown_protocol"
        )
        .increment(1);
    }

    pub(crate) fn inbound_rejected(&self, reason: &'static str) {
        metrics::counter!(
            "notifications_inbound_rejected_total",
            "protocol" => self.protocol.clone(),
            "backend" => self.backend,
            "reason" => reason
        )
        .increment(1);
    }
}
