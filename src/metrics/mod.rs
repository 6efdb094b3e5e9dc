use opentelemetry::{
    metrics::{Counter, Meter, ObservableGauge, Unit},
    KeyValue,
};

pub(crate) struct Metrics {
    negotiation_count: Counter<u64>,
    negotiation_failure_count: Counter<u64>,
    candidate_count: Counter<u64>,
    message_sent_count: Counter<u64>,
    message_received_count: Counter<u64>,
    negotiation_time: ObservableGauge<u64>,
}

impl Metrics {
    pub(crate) fn new(meter: Meter) -> Self {
        Self {
            negotiation_count: meter.u64_counter("negotiation_count").init(),
            negotiation_failure_count: meter.u64_counter("negotiation_failure_count").init(),
            candidate_count: meter.u64_counter("candidate_count").init(),
            message_sent_count: meter.u64_counter("message_sent_count").init(),
            message_received_count: meter.u64_counter("message_received_count").init(),
            negotiation_time: meter
                .u64_observable_gauge("negotiation_time")
                .with_unit(Unit::new("ms"))
                .init(),
        }
    }

    pub(crate) fn record_negotiation_count(&self, value: u64, attributes: &[KeyValue]) {
        self.negotiation_count.add(value, attributes);
    }

    pub(crate) fn record_negotiation_failure_count(&self, value: u64, attributes: &[KeyValue]) {
        self.negotiation_failure_count.add(value, attributes);
    }

    pub(crate) fn record_candidate_count(&self, value: u64, attributes: &[KeyValue]) {
        self.candidate_count.add(value, attributes);
    }

    pub(crate) fn record_message_sent_count(&self, value: u64, attributes: &[KeyValue]) {
        self.message_sent_count.add(value, attributes);
    }

    pub(crate) fn record_message_received_count(&self, value: u64, attributes: &[KeyValue]) {
        self.message_received_count.add(value, attributes);
    }

    pub(crate) fn record_negotiation_time(&self, value: u64, attributes: &[KeyValue]) {
        self.negotiation_time.observe(value, attributes);
    }
}
