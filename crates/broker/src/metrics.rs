use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EndpointMetricKey {
    endpoint: String,
    method: String,
}

pub struct BrokerMetrics {
    request_duration_count: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_duration_sum_ms: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_errors_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    request_rate_total: Mutex<HashMap<EndpointMetricKey, u64>>,
    connections_opened_total: AtomicU64,
    connections_closed_total: Mutex<HashMap<String, u64>>,
    active_connections: AtomicI64,
    events_dispatched_total: Mutex<HashMap<String, u64>>,
    decode_errors_total: AtomicU64,
    write_failures_total: AtomicU64,
    loop_restarts_total: Mutex<HashMap<String, u64>>,
}

const DISPATCH_OUTCOMES: [&str; 3] = ["handled", "unregistered", "panicked"];
static GLOBAL_METRICS: OnceLock<Arc<BrokerMetrics>> = OnceLock::new();

impl Default for BrokerMetrics {
    fn default() -> Self {
        let mut events_dispatched_total = HashMap::new();
        for outcome in DISPATCH_OUTCOMES {
            events_dispatched_total.insert(outcome.to_string(), 0);
        }

        Self {
            request_duration_count: Mutex::new(HashMap::new()),
            request_duration_sum_ms: Mutex::new(HashMap::new()),
            request_errors_total: Mutex::new(HashMap::new()),
            request_rate_total: Mutex::new(HashMap::new()),
            connections_opened_total: AtomicU64::new(0),
            connections_closed_total: Mutex::new(HashMap::new()),
            active_connections: AtomicI64::new(0),
            events_dispatched_total: Mutex::new(events_dispatched_total),
            decode_errors_total: AtomicU64::new(0),
            write_failures_total: AtomicU64::new(0),
            loop_restarts_total: Mutex::new(HashMap::new()),
        }
    }
}

pub fn set_global_metrics(metrics: Arc<BrokerMetrics>) {
    let _ = GLOBAL_METRICS.set(metrics);
}

pub fn global_metrics() -> Option<&'static Arc<BrokerMetrics>> {
    GLOBAL_METRICS.get()
}

pub fn record_http_request(method: &str, path: &str, status_code: u16, latency_ms: u64) {
    if let Some(metrics) = global_metrics() {
        metrics.record_http_request(method, path, status_code, latency_ms);
    }
}

pub fn increment_connections_opened() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_connections_opened();
    }
}

pub fn increment_connections_closed(reason: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_connections_closed(reason);
    }
}

pub fn set_active_connections(value: usize) {
    if let Some(metrics) = global_metrics() {
        metrics.set_active_connections(value);
    }
}

pub fn record_dispatch(outcome: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.record_dispatch(outcome);
    }
}

pub fn increment_decode_errors() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_decode_errors();
    }
}

pub fn increment_write_failures() {
    if let Some(metrics) = global_metrics() {
        metrics.increment_write_failures();
    }
}

pub fn increment_loop_restarts(loop_name: &str) {
    if let Some(metrics) = global_metrics() {
        metrics.increment_loop_restarts(loop_name);
    }
}

impl BrokerMetrics {
    pub fn record_http_request(&self, method: &str, path: &str, status_code: u16, latency_ms: u64) {
        let key = EndpointMetricKey {
            endpoint: normalize_endpoint(path),
            method: method.to_ascii_uppercase(),
        };

        increment_counter(&self.request_rate_total, &key, 1);
        increment_counter(&self.request_duration_sum_ms, &key, latency_ms);
        increment_counter(&self.request_duration_count, &key, 1);
        if status_code >= 400 {
            increment_counter(&self.request_errors_total, &key, 1);
        }
    }

    pub fn increment_connections_opened(&self) {
        self.connections_opened_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_connections_closed(&self, reason: &str) {
        increment_label_counter(&self.connections_closed_total, &normalize_label(reason), 1);
    }

    pub fn set_active_connections(&self, value: usize) {
        self.active_connections.store(i64::try_from(value).unwrap_or(i64::MAX), Ordering::SeqCst);
    }

    pub fn record_dispatch(&self, outcome: &str) {
        let normalized = normalize_label(outcome);
        let label = if DISPATCH_OUTCOMES.contains(&normalized.as_str()) {
            normalized
        } else {
            "unknown".to_string()
        };
        increment_label_counter(&self.events_dispatched_total, &label, 1);
    }

    pub fn increment_decode_errors(&self) {
        self.decode_errors_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn increment_write_failures(&self) {
        self.write_failures_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures_total.load(Ordering::SeqCst)
    }

    pub fn increment_loop_restarts(&self, loop_name: &str) {
        increment_label_counter(&self.loop_restarts_total, &normalize_label(loop_name), 1);
    }

    pub fn loop_restarts(&self, loop_name: &str) -> u64 {
        let guard = self.loop_restarts_total.lock().expect("metrics map lock poisoned");
        guard.get(&normalize_label(loop_name)).copied().unwrap_or(0)
    }

    pub fn render_prometheus(&self) -> String {
        let mut output = String::new();

        output.push_str("# HELP broker_request_rate_total Total HTTP requests by endpoint.\n");
        output.push_str("# TYPE broker_request_rate_total counter\n");
        append_counter_lines(&mut output, "broker_request_rate_total", &self.request_rate_total);

        output.push_str(
            "# HELP broker_request_errors_total Total HTTP error responses by endpoint.\n",
        );
        output.push_str("# TYPE broker_request_errors_total counter\n");
        append_counter_lines(&mut output, "broker_request_errors_total", &self.request_errors_total);

        output.push_str("# HELP broker_request_duration_ms_sum Sum of HTTP request latency in milliseconds by endpoint.\n");
        output.push_str("# TYPE broker_request_duration_ms_sum counter\n");
        append_counter_lines(
            &mut output,
            "broker_request_duration_ms_sum",
            &self.request_duration_sum_ms,
        );

        output.push_str("# HELP broker_request_duration_ms_count Count of HTTP request latency samples by endpoint.\n");
        output.push_str("# TYPE broker_request_duration_ms_count counter\n");
        append_counter_lines(
            &mut output,
            "broker_request_duration_ms_count",
            &self.request_duration_count,
        );

        output.push_str(
            "# HELP broker_connections_opened_total Total connections registered.\n",
        );
        output.push_str("# TYPE broker_connections_opened_total counter\n");
        output.push_str(&format!(
            "broker_connections_opened_total {}\n",
            self.connections_opened_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP broker_connections_closed_total Total connections removed by reason.\n",
        );
        output.push_str("# TYPE broker_connections_closed_total counter\n");
        append_label_counter_lines(
            &mut output,
            "broker_connections_closed_total",
            "reason",
            &self.connections_closed_total,
        );

        output.push_str("# HELP broker_active_connections Connections currently registered.\n");
        output.push_str("# TYPE broker_active_connections gauge\n");
        output.push_str(&format!(
            "broker_active_connections {}\n",
            self.active_connections.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP broker_events_dispatched_total Inbound events by dispatch outcome.\n",
        );
        output.push_str("# TYPE broker_events_dispatched_total counter\n");
        append_label_counter_lines(
            &mut output,
            "broker_events_dispatched_total",
            "outcome",
            &self.events_dispatched_total,
        );

        output.push_str("# HELP broker_decode_errors_total Inbound frames that failed to decode.\n");
        output.push_str("# TYPE broker_decode_errors_total counter\n");
        output.push_str(&format!(
            "broker_decode_errors_total {}\n",
            self.decode_errors_total.load(Ordering::SeqCst)
        ));

        output.push_str("# HELP broker_write_failures_total Socket writes that failed.\n");
        output.push_str("# TYPE broker_write_failures_total counter\n");
        output.push_str(&format!(
            "broker_write_failures_total {}\n",
            self.write_failures_total.load(Ordering::SeqCst)
        ));

        output.push_str(
            "# HELP broker_loop_restarts_total Supervised loop restarts after a panic.\n",
        );
        output.push_str("# TYPE broker_loop_restarts_total counter\n");
        append_label_counter_lines(
            &mut output,
            "broker_loop_restarts_total",
            "loop",
            &self.loop_restarts_total,
        );

        output
    }
}

fn normalize_endpoint(path: &str) -> String {
    if path.is_empty() {
        return "/".to_string();
    }

    let mut normalized_segments = Vec::new();
    for segment in path.split('/').filter(|segment| !segment.is_empty()) {
        if uuid::Uuid::parse_str(segment).is_ok() {
            normalized_segments.push("{uuid}".to_string());
            continue;
        }

        if segment.chars().all(|character| character.is_ascii_digit()) {
            normalized_segments.push("{number}".to_string());
            continue;
        }

        normalized_segments.push(segment.to_string());
    }

    if normalized_segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", normalized_segments.join("/"))
    }
}

fn normalize_label(label: &str) -> String {
    let normalized = label.trim().to_ascii_lowercase();
    if normalized.is_empty() {
        "unknown".to_string()
    } else {
        normalized
    }
}

fn increment_counter(
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
    key: &EndpointMetricKey,
    delta: u64,
) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(key.clone()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn increment_label_counter(map: &Mutex<HashMap<String, u64>>, label: &str, delta: u64) {
    let mut guard = map.lock().expect("metrics map lock poisoned");
    let value = guard.entry(label.to_string()).or_insert(0);
    *value = value.saturating_add(delta);
}

fn append_counter_lines(
    output: &mut String,
    metric_name: &str,
    map: &Mutex<HashMap<EndpointMetricKey, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left_key, _), (right_key, _)| {
        left_key
            .method
            .cmp(&right_key.method)
            .then_with(|| left_key.endpoint.cmp(&right_key.endpoint))
    });

    for (key, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{method=\"{}\",endpoint=\"{}\"}} {value}\n",
            escape_label_value(&key.method),
            escape_label_value(&key.endpoint),
        ));
    }
}

fn append_label_counter_lines(
    output: &mut String,
    metric_name: &str,
    label_name: &str,
    map: &Mutex<HashMap<String, u64>>,
) {
    let guard = map.lock().expect("metrics map lock poisoned");
    let mut entries: Vec<_> = guard.iter().collect();
    entries.sort_by(|(left, _), (right, _)| left.cmp(right));

    for (label, value) in entries {
        output.push_str(&format!(
            "{metric_name}{{{label_name}=\"{}\"}} {value}\n",
            escape_label_value(label),
        ));
    }
}

fn escape_label_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\n', "\\n").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::BrokerMetrics;

    #[test]
    fn render_prometheus_includes_red_and_broker_metrics() {
        let metrics = BrokerMetrics::default();
        metrics.record_http_request("GET", "/v1/admin/sockets", 200, 15);
        metrics.record_http_request("post", "/v1/admin/broadcast", 503, 25);
        metrics.increment_connections_opened();
        metrics.increment_connections_opened();
        metrics.increment_connections_closed("write_failed");
        metrics.set_active_connections(1);
        metrics.record_dispatch("handled");
        metrics.record_dispatch("panicked");
        metrics.record_dispatch("not-an-outcome");
        metrics.increment_decode_errors();
        metrics.increment_write_failures();
        metrics.increment_loop_restarts("actor");
        metrics.increment_loop_restarts("actor");

        let rendered = metrics.render_prometheus();

        assert!(rendered.contains(
            "broker_request_rate_total{method=\"GET\",endpoint=\"/v1/admin/sockets\"} 1"
        ));
        assert!(rendered.contains(
            "broker_request_errors_total{method=\"POST\",endpoint=\"/v1/admin/broadcast\"} 1"
        ));
        assert!(rendered.contains("broker_connections_opened_total 2"));
        assert!(rendered.contains("broker_connections_closed_total{reason=\"write_failed\"} 1"));
        assert!(rendered.contains("broker_active_connections 1"));
        assert!(rendered.contains("broker_events_dispatched_total{outcome=\"handled\"} 1"));
        assert!(rendered.contains("broker_events_dispatched_total{outcome=\"unregistered\"} 0"));
        assert!(rendered.contains("broker_events_dispatched_total{outcome=\"panicked\"} 1"));
        assert!(rendered.contains("broker_events_dispatched_total{outcome=\"unknown\"} 1"));
        assert!(rendered.contains("broker_decode_errors_total 1"));
        assert!(rendered.contains("broker_write_failures_total 1"));
        assert!(rendered.contains("broker_loop_restarts_total{loop=\"actor\"} 2"));
        assert_eq!(metrics.loop_restarts("actor"), 2);
    }

    #[test]
    fn numeric_path_segments_are_collapsed() {
        let metrics = BrokerMetrics::default();
        metrics.record_http_request("GET", "/v1/users/42/sockets", 200, 1);

        assert!(metrics.render_prometheus().contains("endpoint=\"/v1/users/{number}/sockets\""));
    }
}
