//! Prometheus metrics for the data layer.
//!
//! Counters are registered in the default registry on first use; cache tier
//! gauges are refreshed from partition snapshots at scrape time.

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge_vec, Encoder, IntCounterVec, IntGaugeVec,
    TextEncoder,
};

use crate::cache::CacheTier;
use crate::error::{Error, Result};

/// Façade operations by kind, partition and outcome.
pub static DATAMANAGER_OPS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "chargedb_datamanager_ops_total",
        "DataManager operations",
        &["op", "partition", "status"],
    )
});

/// Failed calls to replication peers.
pub static REPLICATION_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "chargedb_replication_failures_total",
        "Failed replication calls",
        &["op"],
    )
});

/// Outbound cache service calls by method.
pub static CACHE_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
    counter_vec(
        "chargedb_cache_calls_total",
        "Cache invalidation calls sent",
        &["method"],
    )
});

static CACHE_ENTRIES: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec("chargedb_cache_entries", "Cached items", &["partition"])
});

static CACHE_HITS: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec("chargedb_cache_hits", "Cache hits since start", &["partition"])
});

static CACHE_MISSES: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec("chargedb_cache_misses", "Cache misses since start", &["partition"])
});

static CACHE_EVICTIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    gauge_vec(
        "chargedb_cache_evictions",
        "Cache evictions since start",
        &["partition"],
    )
});

/// Record the outcome of a façade operation.
pub fn record_op<T>(op: &str, partition: &str, res: &Result<T>) {
    let status = match res {
        Ok(_) => "ok",
        Err(Error::NotFound) => "not_found",
        Err(e) if e.is_committed() => "committed_with_error",
        Err(_) => "error",
    };
    DATAMANAGER_OPS
        .with_label_values(&[op, partition, status])
        .inc();
}

/// Copy cache tier snapshots into the exported gauges.
pub fn export_cache_stats(tier: &CacheTier) {
    for (id, snap) in tier.stats() {
        let label = [id.as_str()];
        CACHE_ENTRIES
            .with_label_values(&label)
            .set(snap.entries as i64);
        CACHE_HITS.with_label_values(&label).set(snap.hits as i64);
        CACHE_MISSES.with_label_values(&label).set(snap.misses as i64);
        CACHE_EVICTIONS
            .with_label_values(&label)
            .set(snap.evictions as i64);
    }
}

/// Render the default registry in the text exposition format.
pub fn render() -> Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| Error::Internal(format!("metrics encoding failed: {}", e)))?;
    Ok((encoder.format_type().to_string(), buffer))
}

// Duplicate registration falls back to an unregistered collector.
fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    register_int_counter_vec!(name, help, labels).unwrap_or_else(|_| {
        IntCounterVec::new(prometheus::Opts::new(name, help), labels)
            .unwrap_or_else(|e| panic!("invalid metric {}: {}", name, e))
    })
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    register_int_gauge_vec!(name, help, labels).unwrap_or_else(|_| {
        IntGaugeVec::new(prometheus::Opts::new(name, help), labels)
            .unwrap_or_else(|e| panic!("invalid metric {}: {}", name, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::domain::{CacheId, CacheStore, CacheValue, NON_TRANSACTIONAL};

    #[test]
    fn test_record_op_and_render() {
        record_op::<()>("get", "*filters", &Err(Error::NotFound));
        record_op("set", "*filters", &Ok(()));
        let (content_type, body) = render().unwrap();
        assert!(content_type.starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("chargedb_datamanager_ops_total"));
    }

    #[test]
    fn test_export_cache_stats() {
        let tier = CacheTier::new(&CacheConfig::default());
        tier.set(CacheId::Destinations, "k", CacheValue::Absent, &[], NON_TRANSACTIONAL);
        export_cache_stats(&tier);
        assert_eq!(
            CACHE_ENTRIES
                .with_label_values(&["*destinations"])
                .get(),
            1
        );
    }
}
