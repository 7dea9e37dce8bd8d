use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Latency and status samples collected by the in-process load driver.
#[derive(Debug, Clone)]
pub struct LoadMetrics {
    pub start_time: Instant,
    pub response_times: Vec<Duration>,
    pub error_count: u64,
    pub request_count: u64,
    pub status_codes: BTreeMap<u16, u64>,
    pub bytes_received: u64,
    pub connection_errors: u64,
}

impl Default for LoadMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            response_times: Vec::new(),
            error_count: 0,
            request_count: 0,
            status_codes: BTreeMap::new(),
            bytes_received: 0,
            connection_errors: 0,
        }
    }

    pub fn record_response(&mut self, response_time: Duration, status_code: u16, bytes: u64) {
        self.response_times.push(response_time);
        self.request_count += 1;
        self.bytes_received += bytes;
        *self.status_codes.entry(status_code).or_insert(0) += 1;

        if !(200..400).contains(&status_code) {
            self.error_count += 1;
        }
    }

    pub fn record_connection_error(&mut self) {
        self.connection_errors += 1;
        self.error_count += 1;
    }

    pub fn merge(&mut self, other: &LoadMetrics) {
        self.response_times.extend(other.response_times.iter());
        self.error_count += other.error_count;
        self.request_count += other.request_count;
        self.bytes_received += other.bytes_received;
        self.connection_errors += other.connection_errors;

        for (status, count) in &other.status_codes {
            *self.status_codes.entry(*status).or_insert(0) += count;
        }
    }

    pub fn summarize(&self, elapsed: Duration) -> LoadSummary {
        let total_requests = self.request_count + self.connection_errors;
        let seconds = elapsed.as_secs_f64();
        let requests_per_second = if seconds > 0.0 {
            self.request_count as f64 / seconds
        } else {
            0.0
        };

        if self.response_times.is_empty() {
            return LoadSummary {
                total_requests,
                errors: self.error_count,
                connection_errors: self.connection_errors,
                requests_per_second,
                mean_ms: None,
                min_ms: None,
                max_ms: None,
                p50_ms: None,
                p95_ms: None,
                p99_ms: None,
                status_codes: self.status_codes.clone(),
                bytes_per_second: 0.0,
                duration_ms: elapsed.as_millis() as u64,
            };
        }

        let mut sorted = self.response_times.clone();
        sorted.sort();
        let percentile = |p: usize| sorted.get((sorted.len() * p / 100).min(sorted.len() - 1));
        let ms = |d: &Duration| d.as_secs_f64() * 1000.0;
        let total: Duration = sorted.iter().sum();

        LoadSummary {
            total_requests,
            errors: self.error_count,
            connection_errors: self.connection_errors,
            requests_per_second,
            mean_ms: Some(ms(&total) / sorted.len() as f64),
            min_ms: sorted.first().map(ms),
            max_ms: sorted.last().map(ms),
            p50_ms: percentile(50).map(ms),
            p95_ms: percentile(95).map(ms),
            p99_ms: percentile(99).map(ms),
            status_codes: self.status_codes.clone(),
            bytes_per_second: if seconds > 0.0 {
                self.bytes_received as f64 / seconds
            } else {
                0.0
            },
            duration_ms: elapsed.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    pub total_requests: u64,
    pub errors: u64,
    pub connection_errors: u64,
    pub requests_per_second: f64,
    pub mean_ms: Option<f64>,
    pub min_ms: Option<f64>,
    pub max_ms: Option<f64>,
    pub p50_ms: Option<f64>,
    pub p95_ms: Option<f64>,
    pub p99_ms: Option<f64>,
    pub status_codes: BTreeMap<u16, u64>,
    pub bytes_per_second: f64,
    pub duration_ms: u64,
}
