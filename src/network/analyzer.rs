//! Estimates network characteristics from observed requests.
//!
//! Every function here is pure over a slice of completed requests. Records may
//! be passed owned or shared (`&[NetworkRequest]` or `&[Arc<NetworkRequest>]`).
//!
//! # Example
//!
//! ```rust,ignore
//! use lantern::network::NetworkAnalyzer;
//!
//! let analysis = NetworkAnalyzer::analyze(&records)?;
//! println!("rtt={}ms throughput={}bps", analysis.rtt, analysis.throughput);
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::NetworkAnalysisError;
use crate::network::request::{equal_without_fragment, NetworkRequest, ResourceTiming, ResourceType};
use crate::types::Milliseconds;

/// Key of the cross-origin summary entry.
pub const SUMMARY_KEY: &str = "__SUMMARY__";

/// Bytes that fit in the initial congestion window.
const INITIAL_CWD: f64 = 14.0 * 1024.0;

/// Share of the time to first byte attributed to the server, by resource type.
fn server_response_share(resource_type: ResourceType) -> f64 {
    match resource_type {
        ResourceType::Document => 0.4,
        ResourceType::XHR | ResourceType::Media => 0.2,
        ResourceType::Font | ResourceType::Stylesheet => 0.3,
        ResourceType::Script => 0.5,
        _ => 0.4,
    }
}

/// Distribution summary of a set of estimates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub median: f64,
}

impl Summary {
    /// Summarizes a non-empty list of values.
    pub fn of(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let mid = (sorted.len() - 1) / 2;
        let median = if sorted.len() % 2 == 0 {
            (sorted[mid] + sorted[mid + 1]) / 2.0
        } else {
            sorted[mid]
        };
        Some(Self {
            min: sorted[0],
            max: sorted[sorted.len() - 1],
            avg: sorted.iter().sum::<f64>() / sorted.len() as f64,
            median,
        })
    }
}

/// Knobs for [`NetworkAnalyzer::estimate_rtt_by_origin`].
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RttEstimateOptions {
    /// Skip connection timing and use only the coarse estimators
    pub force_coarse_estimates: bool,
    /// Scale applied to coarse estimates, which overestimate RTT
    pub coarse_estimate_multiplier: f64,
    pub use_download_estimates: bool,
    pub use_send_start_estimates: bool,
    pub use_headers_end_estimates: bool,
}

impl Default for RttEstimateOptions {
    fn default() -> Self {
        Self {
            force_coarse_estimates: false,
            coarse_estimate_multiplier: 0.3,
            use_download_estimates: true,
            use_send_start_estimates: true,
            use_headers_end_estimates: true,
        }
    }
}

/// Observed network characteristics of a page load.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAnalysis {
    /// Minimum RTT across origins
    pub rtt: Milliseconds,
    /// Bits per second over periods with active downloads
    pub throughput: f64,
    pub additional_rtt_by_origin: BTreeMap<String, Milliseconds>,
    pub server_response_time_by_origin: BTreeMap<String, Milliseconds>,
}

/// Persisted per-origin network analysis.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanternData {
    #[serde(default)]
    pub additional_rtt_by_origin: BTreeMap<String, Milliseconds>,
    #[serde(default)]
    pub server_response_time_by_origin: BTreeMap<String, Milliseconds>,
}

impl LanternData {
    /// Returns `(additional_rtt_by_origin, server_response_time_by_origin)`.
    pub fn to_maps(&self) -> (BTreeMap<String, Milliseconds>, BTreeMap<String, Milliseconds>) {
        (
            self.additional_rtt_by_origin.clone(),
            self.server_response_time_by_origin.clone(),
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Per-record context handed to the estimators.
struct EstimateInput<'a> {
    record: &'a NetworkRequest,
    timing: &'a ResourceTiming,
    connection_reused: bool,
}

type Estimator = fn(&EstimateInput<'_>) -> Vec<f64>;

/// Static analysis functions over network records.
pub struct NetworkAnalyzer;

impl NetworkAnalyzer {
    /// Partitions records by security origin.
    pub fn group_by_origin<R: AsRef<NetworkRequest>>(records: &[R]) -> BTreeMap<String, Vec<&NetworkRequest>> {
        let mut grouped: BTreeMap<String, Vec<&NetworkRequest>> = BTreeMap::new();
        for record in records {
            let record = record.as_ref();
            grouped.entry(record.origin().to_string()).or_default().push(record);
        }
        grouped
    }

    /// Summarizes each key's estimates and adds a [`SUMMARY_KEY`] entry over all of them.
    pub fn summarize(values: &BTreeMap<String, Vec<f64>>) -> BTreeMap<String, Summary> {
        let mut summaries = BTreeMap::new();
        let mut all = Vec::new();
        for (key, estimates) in values {
            if let Some(summary) = Summary::of(estimates) {
                summaries.insert(key.clone(), summary);
            }
            all.extend_from_slice(estimates);
        }
        if let Some(summary) = Summary::of(&all) {
            summaries.insert(SUMMARY_KEY.to_string(), summary);
        }
        summaries
    }

    /// Whether a record's own timing shows it skipped the handshake.
    fn timing_shows_reuse(timing: &ResourceTiming) -> bool {
        let no_connect = timing.connect_start == -1.0 && timing.connect_end == -1.0;
        let zero_length = timing.connect_start >= 0.0 && timing.connect_end == timing.connect_start;
        no_connect || zero_length
    }

    /// Estimates, per request id, whether the request reused a warm connection.
    ///
    /// Without `force_coarse_estimates` a record's own connection timing decides;
    /// records lacking timing and every record in coarse mode use ordering: a
    /// request is reused when it is h2 or started after some same-origin request
    /// ended. The first request of each origin is always fresh in coarse mode.
    pub fn estimate_if_connection_was_reused<R: AsRef<NetworkRequest>>(
        records: &[R],
        force_coarse_estimates: bool,
    ) -> BTreeMap<String, bool> {
        let mut reused = BTreeMap::new();
        for origin_records in Self::group_by_origin(records).values() {
            let earliest_reuse_possible = origin_records
                .iter()
                .map(|r| r.network_end_time)
                .fold(f64::INFINITY, f64::min);
            let first = origin_records
                .iter()
                .copied()
                .reduce(|a, b| if a.network_request_time > b.network_request_time { b } else { a });

            for record in origin_records {
                let coarse = if first.is_some_and(|f| std::ptr::eq(f, *record)) {
                    false
                } else {
                    record.network_request_time >= earliest_reuse_possible || record.is_h2()
                };
                let estimate = match (&record.timing, force_coarse_estimates) {
                    (Some(timing), false) => Self::timing_shows_reuse(timing),
                    _ => coarse,
                };
                reused.insert(record.request_id.clone(), estimate);
            }
        }
        reused
    }

    /// Runs `estimator` over every timed record and collects estimates per origin.
    fn estimate_value_by_origin<R, F>(
        records: &[R],
        mut estimator: F,
    ) -> BTreeMap<String, Vec<f64>>
    where
        R: AsRef<NetworkRequest>,
        F: FnMut(&EstimateInput<'_>) -> Vec<f64>,
    {
        let reused = Self::estimate_if_connection_was_reused(records, false);
        let mut by_origin = BTreeMap::new();
        for (origin, origin_records) in Self::group_by_origin(records) {
            let mut estimates = Vec::new();
            for record in origin_records {
                let Some(timing) = record.timing.as_ref() else {
                    continue;
                };
                let input = EstimateInput {
                    record,
                    timing,
                    connection_reused: reused.get(&record.request_id).copied().unwrap_or(false),
                };
                estimates.extend(estimator(&input));
            }
            if !estimates.is_empty() {
                by_origin.insert(origin, estimates);
            }
        }
        by_origin
    }

    fn rtt_via_connection_timing(input: &EstimateInput<'_>) -> Vec<f64> {
        if input.connection_reused {
            return Vec::new();
        }
        let t = input.timing;
        if t.connect_end >= 0.0 && t.connect_start >= 0.0 && input.record.is_h3() {
            // QUIC folds the TLS handshake into one round trip
            vec![t.connect_end - t.connect_start]
        } else if t.ssl_start >= 0.0 && t.ssl_end >= 0.0 && t.ssl_start != t.connect_start {
            vec![t.connect_end - t.ssl_start, t.ssl_start - t.connect_start]
        } else if t.connect_start >= 0.0 && t.connect_end >= 0.0 {
            vec![t.connect_end - t.connect_start]
        } else {
            Vec::new()
        }
    }

    fn rtt_via_download_timing(input: &EstimateInput<'_>) -> Vec<f64> {
        let record = input.record;
        let t = input.timing;
        if input.connection_reused || record.transfer_size <= INITIAL_CWD {
            return Vec::new();
        }
        if !t.receive_headers_end.is_finite() || t.receive_headers_end < 0.0 {
            return Vec::new();
        }
        let total_time = record.network_end_time - record.network_request_time;
        let download_after_first_byte = total_time - t.receive_headers_end;
        let round_trips = (record.transfer_size / INITIAL_CWD).log2();
        if round_trips > 5.0 {
            return Vec::new();
        }
        vec![download_after_first_byte / round_trips]
    }

    fn rtt_via_send_start_timing(input: &EstimateInput<'_>) -> Vec<f64> {
        let t = input.timing;
        if input.connection_reused || !t.send_start.is_finite() || t.send_start < 0.0 {
            return Vec::new();
        }
        let mut round_trips = 1.0;
        if !input.record.is_h3() {
            round_trips += 1.0;
        }
        if input.record.parsed_url.scheme == "https" {
            round_trips += 1.0;
        }
        vec![t.send_start / round_trips]
    }

    fn rtt_via_headers_end_timing(input: &EstimateInput<'_>) -> Vec<f64> {
        let t = input.timing;
        if !t.receive_headers_end.is_finite() || t.receive_headers_end < 0.0 {
            return Vec::new();
        }
        let server_time = t.receive_headers_end * server_response_share(input.record.resource_type);
        let mut round_trips = 1.0;
        if !input.connection_reused {
            round_trips += 1.0;
            if !input.record.is_h3() {
                round_trips += 1.0;
            }
            if input.record.parsed_url.scheme == "https" {
                round_trips += 1.0;
            }
        }
        vec![((t.receive_headers_end - server_time) / round_trips).max(3.0)]
    }

    /// Estimates RTT per origin, summarized, with a [`SUMMARY_KEY`] entry.
    ///
    /// Connection timing of fresh connections is preferred; origins without it
    /// fall back to coarse estimators scaled by `coarse_estimate_multiplier`.
    pub fn estimate_rtt_by_origin<R: AsRef<NetworkRequest>>(
        records: &[R],
        options: &RttEstimateOptions,
    ) -> Result<BTreeMap<String, Summary>, NetworkAnalysisError> {
        let reused = Self::estimate_if_connection_was_reused(records, false);
        let mut by_origin: BTreeMap<String, Vec<f64>> = BTreeMap::new();

        for (origin, origin_records) in Self::group_by_origin(records) {
            let collect = |estimates: &mut Vec<f64>, estimator: Estimator, multiplier: f64| {
                for record in &origin_records {
                    let Some(timing) = record.timing.as_ref() else {
                        continue;
                    };
                    let input = EstimateInput {
                        record,
                        timing,
                        connection_reused: reused.get(&record.request_id).copied().unwrap_or(false),
                    };
                    estimates.extend(estimator(&input).into_iter().map(|e| e * multiplier));
                }
            };

            let mut estimates = Vec::new();
            if !options.force_coarse_estimates {
                collect(&mut estimates, Self::rtt_via_connection_timing, 1.0);
            }
            if estimates.is_empty() {
                let m = options.coarse_estimate_multiplier;
                if options.use_download_estimates {
                    collect(&mut estimates, Self::rtt_via_download_timing, m);
                }
                if options.use_send_start_estimates {
                    collect(&mut estimates, Self::rtt_via_send_start_timing, m);
                }
                if options.use_headers_end_estimates {
                    collect(&mut estimates, Self::rtt_via_headers_end_timing, m);
                }
            }
            if !estimates.is_empty() {
                by_origin.insert(origin, estimates);
            }
        }

        if by_origin.is_empty() {
            return Err(NetworkAnalysisError::NoTimingInformation);
        }
        Ok(Self::summarize(&by_origin))
    }

    /// Estimates server response time per origin given an RTT per origin.
    ///
    /// Origins missing from `rtt_by_origin` use its [`SUMMARY_KEY`] entry.
    pub fn estimate_server_response_time_by_origin<R: AsRef<NetworkRequest>>(
        records: &[R],
        rtt_by_origin: &BTreeMap<String, Milliseconds>,
    ) -> BTreeMap<String, Summary> {
        let estimates = Self::estimate_value_by_origin(records, |input| {
            if let Some(observed) = input.record.server_response_time {
                return vec![observed];
            }
            let t = input.timing;
            if !t.receive_headers_end.is_finite() || t.receive_headers_end < 0.0 {
                return Vec::new();
            }
            let sent = if t.send_end >= 0.0 { t.send_end } else { t.send_start };
            if !sent.is_finite() || sent < 0.0 {
                return Vec::new();
            }
            let rtt = rtt_by_origin
                .get(input.record.origin())
                .or_else(|| rtt_by_origin.get(SUMMARY_KEY))
                .copied()
                .unwrap_or(0.0);
            vec![(t.receive_headers_end - sent - rtt).max(0.0)]
        });
        Self::summarize(&estimates)
    }

    /// Bits per second over the union of download windows.
    ///
    /// Returns infinity when no request carried a body.
    pub fn estimate_throughput<R: AsRef<NetworkRequest>>(records: &[R]) -> f64 {
        let mut total_bytes = 0.0;
        let mut boundaries: Vec<(f64, bool)> = Vec::new();
        for record in records {
            let record = record.as_ref();
            if record.parsed_url.scheme == "data"
                || record.failed
                || !record.finished
                || record.status_code > 300
                || record.transfer_size <= 0.0
            {
                continue;
            }
            total_bytes += record.transfer_size;
            boundaries.push((record.response_headers_end_time / 1000.0, true));
            boundaries.push((record.network_end_time / 1000.0, false));
        }
        if boundaries.is_empty() {
            return f64::INFINITY;
        }
        boundaries.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut inflight = 0usize;
        let mut current_start = 0.0;
        let mut total_duration = 0.0;
        for (time, is_start) in boundaries {
            if is_start {
                if inflight == 0 {
                    current_start = time;
                }
                inflight += 1;
            } else {
                inflight = inflight.saturating_sub(1);
                if inflight == 0 {
                    total_duration += time - current_start;
                }
            }
        }
        total_bytes * 8.0 / total_duration
    }

    /// Minimum RTT, per-origin additional RTT and median server response time.
    pub fn compute_rtt_and_server_response_time<R: AsRef<NetworkRequest>>(
        records: &[R],
    ) -> Result<NetworkAnalysis, NetworkAnalysisError> {
        let rtt_by_origin: BTreeMap<String, f64> =
            Self::estimate_rtt_by_origin(records, &RttEstimateOptions::default())?
                .into_iter()
                .map(|(origin, summary)| (origin, summary.min.max(1.0)))
                .collect();
        let minimum_rtt = rtt_by_origin.values().copied().fold(f64::INFINITY, f64::min);

        let mut analysis = NetworkAnalysis {
            rtt: minimum_rtt,
            ..Default::default()
        };
        for (origin, summary) in Self::estimate_server_response_time_by_origin(records, &rtt_by_origin) {
            let origin_rtt = rtt_by_origin.get(&origin).copied().unwrap_or(minimum_rtt);
            analysis
                .additional_rtt_by_origin
                .insert(origin.clone(), origin_rtt - minimum_rtt);
            analysis.server_response_time_by_origin.insert(origin, summary.median);
        }
        tracing::debug!(
            rtt = analysis.rtt,
            origins = analysis.server_response_time_by_origin.len(),
            "estimated rtt and server response times"
        );
        Ok(analysis)
    }

    /// Full analysis: throughput plus RTT and server response times.
    pub fn analyze<R: AsRef<NetworkRequest>>(records: &[R]) -> Result<NetworkAnalysis, NetworkAnalysisError> {
        let throughput = Self::estimate_throughput(records);
        let analysis = Self::compute_rtt_and_server_response_time(records)?;
        Ok(NetworkAnalysis { throughput, ..analysis })
    }

    /// First record whose URL matches, ignoring fragments.
    pub fn find_resource_for_url<'a, R: AsRef<NetworkRequest>>(
        records: &'a [R],
        url: &str,
    ) -> Option<&'a NetworkRequest> {
        records
            .iter()
            .map(AsRef::as_ref)
            .find(|r| url.starts_with(r.url.as_str()) && equal_without_fragment(&r.url, url))
    }

    /// Last non-failed document matching the URL, ignoring fragments.
    pub fn find_last_document_for_url<'a, R: AsRef<NetworkRequest>>(
        records: &'a [R],
        url: &str,
    ) -> Option<&'a NetworkRequest> {
        records
            .iter()
            .map(AsRef::as_ref)
            .filter(|r| r.is_document() && !r.failed && equal_without_fragment(&r.url, url))
            .last()
    }

    /// The main document: the last document for `url`, or the earliest document.
    pub fn find_main_document<'a, R: AsRef<NetworkRequest>>(
        records: &'a [R],
        url: Option<&str>,
    ) -> Option<&'a NetworkRequest> {
        match url {
            Some(url) => Self::find_last_document_for_url(records, url),
            None => records
                .iter()
                .map(AsRef::as_ref)
                .filter(|r| r.is_document())
                .reduce(|a, b| if b.network_request_time < a.network_request_time { b } else { a }),
        }
    }

    /// Follows redirect destinations to the final request.
    pub fn resolve_redirects<'a, R: AsRef<NetworkRequest>>(
        records: &'a [R],
        request: &'a NetworkRequest,
    ) -> &'a NetworkRequest {
        let mut current = request;
        let mut hops = 0;
        while let Some(next_id) = current.redirect_destination_id.as_deref() {
            let Some(next) = records.iter().map(AsRef::as_ref).find(|r| r.request_id == next_id) else {
                break;
            };
            current = next;
            hops += 1;
            if hops > records.len() {
                tracing::warn!(request_id = %request.request_id, "redirect loop detected");
                break;
            }
        }
        current
    }

    /// Keeps only `http*` origins, the shape persisted between runs.
    pub fn convert_analysis_to_saveable_lantern_data(analysis: &NetworkAnalysis) -> LanternData {
        let http_only = |map: &BTreeMap<String, f64>| {
            map.iter()
                .filter(|(origin, _)| origin.starts_with("http"))
                .map(|(origin, value)| (origin.clone(), *value))
                .collect()
        };
        LanternData {
            additional_rtt_by_origin: http_only(&analysis.additional_rtt_by_origin),
            server_response_time_by_origin: http_only(&analysis.server_response_time_by_origin),
        }
    }
}
