use std::sync::LazyLock;

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

pub static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::default);

#[derive(Debug)]
pub struct Metrics {
    _registry: Registry,

    /// Packets dropped during decode, labeled by reason (see `PacketCodecError`).
    pub packets_dropped: IntCounterVec,
    /// Sessions that reached the `Established` state.
    pub sessions_established: IntCounter,
    /// WHOAREYOU challenges sent.
    pub whoareyou_sent: IntCounter,
    /// Lookups currently in flight.
    pub active_lookups: IntGauge,
    /// Live entries currently held across all routing table buckets.
    pub table_occupancy: IntGauge,
}

impl Metrics {
    pub fn record_drop(&self, reason: &str) {
        self.packets_dropped.with_label_values(&[reason]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        let registry = Registry::new();

        let packets_dropped = IntCounterVec::new(
            Opts::new(
                "discv5_packets_dropped_total",
                "Total number of inbound packets dropped during decode, by reason",
            ),
            &["reason"],
        )
        .expect("failed to create packets_dropped counter");

        let sessions_established = IntCounter::new(
            "discv5_sessions_established_total",
            "Total number of sessions that reached the Established state",
        )
        .expect("failed to create sessions_established counter");

        let whoareyou_sent = IntCounter::new(
            "discv5_whoareyou_sent_total",
            "Total number of WHOAREYOU challenges sent",
        )
        .expect("failed to create whoareyou_sent counter");

        let active_lookups = IntGauge::new(
            "discv5_active_lookups",
            "Number of iterative FINDNODE lookups currently in flight",
        )
        .expect("failed to create active_lookups gauge");

        let table_occupancy = IntGauge::new(
            "discv5_routing_table_occupancy",
            "Number of live entries currently held in the routing table",
        )
        .expect("failed to create table_occupancy gauge");

        registry
            .register(Box::new(packets_dropped.clone()))
            .expect("failed to register packets_dropped counter");
        registry
            .register(Box::new(sessions_established.clone()))
            .expect("failed to register sessions_established counter");
        registry
            .register(Box::new(whoareyou_sent.clone()))
            .expect("failed to register whoareyou_sent counter");
        registry
            .register(Box::new(active_lookups.clone()))
            .expect("failed to register active_lookups gauge");
        registry
            .register(Box::new(table_occupancy.clone()))
            .expect("failed to register table_occupancy gauge");

        Metrics {
            _registry: registry,
            packets_dropped,
            sessions_established,
            whoareyou_sent,
            active_lookups,
            table_occupancy,
        }
    }
}
