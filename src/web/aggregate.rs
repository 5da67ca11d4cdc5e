//! Time-bucket aggregation of uptime samples.
//!
//! Buckets are anchored at the first sample of each window rather than
//! an aligned epoch, so results shift with the input's start time.
//! Within a bucket, samples collapse to one synthetic sample per
//! label.

use std::collections::HashMap;
use std::time::Duration;

use crate::storage::{ServiceStatus, UptimeSample};

/// Group a time-ordered series into `interval`-wide buckets and
/// collapse each (bucket, label) pair.
pub fn aggregate_uptime(samples: Vec<UptimeSample>, interval: Duration) -> Vec<UptimeSample> {
    if samples.len() < 2 {
        return samples;
    }

    let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX);

    let mut result = Vec::new();
    let mut bucket: Vec<UptimeSample> = Vec::new();
    let mut anchor = samples[0].time;

    for sample in samples {
        if sample.time - anchor > interval {
            result.extend(collapse_bucket(std::mem::take(&mut bucket)));
            anchor = sample.time;
        }
        bucket.push(sample);
    }

    if !bucket.is_empty() {
        result.extend(collapse_bucket(bucket));
    }

    result
}

/// One synthetic sample per label, labels in first-seen order.
fn collapse_bucket(bucket: Vec<UptimeSample>) -> Vec<UptimeSample> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<UptimeSample>> = HashMap::new();

    for sample in bucket {
        let group = groups.entry(sample.label.clone()).or_default();
        if group.is_empty() {
            order.push(sample.label.clone());
        }
        group.push(sample);
    }

    order
        .into_iter()
        .filter_map(|label| groups.remove(&label).map(collapse_group))
        .collect()
}

/// Collapse one label's samples: mean elapsed, mean latency over the
/// measured (non-negative) values, modal status and http status. Time
/// and label carry over from the group's first sample.
fn collapse_group(samples: Vec<UptimeSample>) -> UptimeSample {
    let elapsed_sum: Duration = samples.iter().map(|s| s.elapsed).sum();
    let elapsed = elapsed_sum / samples.len() as u32;

    let measured: Vec<i64> = samples
        .iter()
        .map(|s| s.latency_ms)
        .filter(|ms| *ms >= 0)
        .collect();
    let latency_ms = if measured.is_empty() {
        -1
    } else {
        measured.iter().sum::<i64>() / measured.len() as i64
    };

    let status = mode(samples.iter().map(|s| s.status)).unwrap_or(ServiceStatus::Down);
    let http_status = mode(samples.iter().filter_map(|s| s.http_status));

    UptimeSample {
        time: samples[0].time,
        label: samples[0].label.clone(),
        status,
        http_status,
        elapsed,
        latency_ms,
        host: None,
        tls_version: None,
    }
}

/// Most frequent value; ties break toward the first seen.
fn mode<T, I>(items: I) -> Option<T>
where
    T: Copy + Eq + std::hash::Hash,
    I: IntoIterator<Item = T>,
{
    let mut counts: HashMap<T, usize> = HashMap::new();
    let mut order: Vec<T> = Vec::new();

    for item in items {
        let count = counts.entry(item).or_default();
        if *count == 0 {
            order.push(item);
        }
        *count += 1;
    }

    let mut best: Option<(T, usize)> = None;
    for item in order {
        let count = counts[&item];
        if best.map_or(true, |(_, n)| count > n) {
            best = Some((item, count));
        }
    }

    best.map(|(item, _)| item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn sample(
        label: &str,
        at: DateTime<Utc>,
        status: ServiceStatus,
        latency_ms: i64,
    ) -> UptimeSample {
        UptimeSample {
            time: at,
            label: label.to_string(),
            status,
            http_status: Some(if status == ServiceStatus::Up { 200 } else { 500 }),
            elapsed: Duration::from_millis(100),
            latency_ms,
            host: None,
            tls_version: None,
        }
    }

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_two_buckets_with_modal_status() {
        let t = base();
        let samples = vec![
            sample("x", t, ServiceStatus::Up, 10),
            sample("x", t + chrono::Duration::seconds(10), ServiceStatus::Up, 20),
            sample("x", t + chrono::Duration::seconds(20), ServiceStatus::Down, -1),
            sample("x", t + chrono::Duration::seconds(90), ServiceStatus::Up, 30),
        ];

        let result = aggregate_uptime(samples, Duration::from_secs(30));
        assert_eq!(result.len(), 2);

        assert_eq!(result[0].status, ServiceStatus::Up);
        assert_eq!(result[0].time, t);
        assert_eq!(result[0].label, "x");
        assert_eq!(result[0].latency_ms, 15);

        assert_eq!(result[1].status, ServiceStatus::Up);
        assert_eq!(result[1].latency_ms, 30);
    }

    #[test]
    fn test_single_bucket_when_interval_covers_span() {
        let t = base();
        let samples = vec![
            sample("x", t, ServiceStatus::Up, 10),
            sample("x", t + chrono::Duration::seconds(20), ServiceStatus::Up, 30),
        ];

        let result = aggregate_uptime(samples, Duration::from_secs(3600));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].latency_ms, 20);
    }

    #[test]
    fn test_per_label_collapse_bounded_by_distinct_labels() {
        let t = base();
        let samples = vec![
            sample("a", t, ServiceStatus::Up, 10),
            sample("b", t + chrono::Duration::seconds(1), ServiceStatus::Down, -1),
            sample("a", t + chrono::Duration::seconds(2), ServiceStatus::Up, 20),
        ];

        let result = aggregate_uptime(samples, Duration::from_secs(60));
        assert_eq!(result.len(), 2);
        assert_eq!(result[0].label, "a");
        assert_eq!(result[1].label, "b");
        assert_eq!(result[1].latency_ms, -1);
    }

    #[test]
    fn test_all_negative_latency_stays_negative() {
        let t = base();
        let samples = vec![
            sample("x", t, ServiceStatus::Down, -1),
            sample("x", t + chrono::Duration::seconds(1), ServiceStatus::Down, -1),
        ];

        let result = aggregate_uptime(samples, Duration::from_secs(60));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].latency_ms, -1);
        assert_eq!(result[0].status, ServiceStatus::Down);
        assert_eq!(result[0].http_status, Some(500));
    }

    #[test]
    fn test_status_tie_breaks_first_seen() {
        let t = base();
        let samples = vec![
            sample("x", t, ServiceStatus::Down, -1),
            sample("x", t + chrono::Duration::seconds(1), ServiceStatus::Up, 5),
        ];

        let result = aggregate_uptime(samples, Duration::from_secs(60));
        assert_eq!(result[0].status, ServiceStatus::Down);
    }

    #[test]
    fn test_short_inputs_pass_through() {
        assert!(aggregate_uptime(Vec::new(), Duration::from_secs(60)).is_empty());

        let single = vec![sample("x", base(), ServiceStatus::Up, 10)];
        let result = aggregate_uptime(single, Duration::from_secs(60));
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].latency_ms, 10);
    }

    #[test]
    fn test_http_status_mode_ignores_absent() {
        let t = base();
        let mut a = sample("x", t, ServiceStatus::Up, 10);
        a.http_status = None;
        let b = sample("x", t + chrono::Duration::seconds(1), ServiceStatus::Up, 20);

        let result = aggregate_uptime(vec![a, b], Duration::from_secs(60));
        assert_eq!(result[0].http_status, Some(200));
    }
}
