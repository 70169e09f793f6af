use once_cell::sync::Lazy;
use opentelemetry::{
    global,
    metrics::{Counter, Histogram},
    KeyValue,
};
use opentelemetry_prometheus::PrometheusExporter;

pub static METRICS: Lazy<PartitioningMetrics> = Lazy::new(PartitioningMetrics::init);

pub struct PartitioningMetrics {
    pub exporter: Option<PrometheusExporter>,
    pub statements_total: Counter<u64>,
    pub statement_errors_total: Counter<u64>,
    pub statement_duration: Histogram<f64>,
    pub lock_retry_attempts_total: Counter<u64>,
    pub lock_retries_exhausted_total: Counter<u64>,
    pub partitions_created_total: Counter<u64>,
    pub partitions_detached_total: Counter<u64>,
    pub default_value_fixes_total: Counter<u64>,
}

impl PartitioningMetrics {
    pub fn init() -> Self {
        let exporter = match opentelemetry_prometheus::exporter().build() {
            Ok(exporter) => Some(exporter),
            Err(e) => {
                log::warn!("prometheus exporter unavailable, partitioning metrics are not exported: {e}");
                None
            }
        };
        let meter = global::meter("lifeguard_partitioning");

        Self {
            exporter,
            statements_total: meter
                .u64_counter("partitioning_statements_total")
                .with_description("Statements issued by partition maintenance")
                .build(),
            statement_errors_total: meter
                .u64_counter("partitioning_statement_errors_total")
                .with_description("Statements that returned an error")
                .build(),
            statement_duration: meter
                .f64_histogram("partitioning_statement_duration_seconds")
                .with_description("Duration of partition maintenance statements")
                .build(),
            lock_retry_attempts_total: meter
                .u64_counter("partitioning_lock_retry_attempts_total")
                .with_description("Lock-retrying blocks that timed out waiting for a lock")
                .build(),
            lock_retries_exhausted_total: meter
                .u64_counter("partitioning_lock_retries_exhausted_total")
                .with_description("Lock-retrying blocks that ran out of attempts")
                .build(),
            partitions_created_total: meter
                .u64_counter("partitioning_partitions_created_total")
                .with_description("Sliding-window partitions created")
                .build(),
            partitions_detached_total: meter
                .u64_counter("partitioning_partitions_detached_total")
                .with_description("Sliding-window partitions detached")
                .build(),
            default_value_fixes_total: meter
                .u64_counter("partitioning_default_value_fixes_total")
                .with_description("Partition key defaults corrected by validate_and_fix")
                .build(),
        }
    }

    pub fn record_statement(&self, elapsed: std::time::Duration) {
        self.statements_total.add(1, &[]);
        self.statement_duration.record(elapsed.as_secs_f64(), &[]);
    }

    pub fn record_statement_error(&self) {
        self.statement_errors_total.add(1, &[]);
    }

    pub fn record_lock_retry(&self) {
        self.lock_retry_attempts_total.add(1, &[]);
    }

    pub fn record_lock_retries_exhausted(&self) {
        self.lock_retries_exhausted_total.add(1, &[]);
    }

    pub fn record_partition_created(&self, table_name: &str) {
        self.partitions_created_total
            .add(1, &[KeyValue::new("table_name", table_name.to_string())]);
    }

    pub fn record_partition_detached(&self, table_name: &str) {
        self.partitions_detached_total
            .add(1, &[KeyValue::new("table_name", table_name.to_string())]);
    }

    pub fn record_default_value_fix(&self, table_name: &str) {
        self.default_value_fixes_total
            .add(1, &[KeyValue::new("table_name", table_name.to_string())]);
    }
}
