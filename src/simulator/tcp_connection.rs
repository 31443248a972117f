//! TCP connection model.
//!
//! Models handshake cost, time to first byte and slow-start growth of the
//! congestion window. Congestion windows count whole segments. Within a round
//! trip bytes arrive at a steady rate, bounded by the window and by the
//! connection's share of the throughput.

use serde::{Deserialize, Serialize};

use crate::types::Milliseconds;

pub const INITIAL_CONGESTION_WINDOW: u64 = 10;
pub const TCP_SEGMENT_SIZE: f64 = 1460.0;

/// Breakdown of the connection setup charged to a download.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTiming {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns_resolution_time: Option<Milliseconds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_time: Option<Milliseconds>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_time: Option<Milliseconds>,
    pub time_to_first_byte: Milliseconds,
    /// Time from the first byte to the last
    pub download_time: Milliseconds,
}

/// Bounds of a single [`TcpConnection::simulate_download_until`] call.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DownloadOptions {
    /// Time already spent on this request
    pub time_already_elapsed: Milliseconds,
    /// Stop after this much time
    pub maximum_time_to_elapse: Milliseconds,
    pub dns_resolution_time: Milliseconds,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            time_already_elapsed: 0.0,
            maximum_time_to_elapse: f64::INFINITY,
            dns_resolution_time: 0.0,
        }
    }
}

/// Outcome of a simulated download.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DownloadResult {
    /// Round trips of the whole request, handshake included
    pub round_trips: u32,
    pub time_elapsed: Milliseconds,
    /// Bytes received during this call
    pub bytes_downloaded: f64,
    /// Bytes received beyond the request's need; only tracked for h2
    pub extra_bytes_downloaded: f64,
    /// Window the connection carries once the request completes
    pub congestion_window: u64,
    pub connection_timing: ConnectionTiming,
}

/// Slow-start windows needed to deliver a payload.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowGrowth {
    /// Windows sent, the one riding with the first byte included
    pub windows: u32,
    pub congestion_window: u64,
    /// Bytes sent past the end of the payload
    pub extra_bytes: f64,
}

/// Bytes received over time by one request.
#[derive(Clone, Copy, Debug)]
struct DownloadCurve {
    time_to_first_byte: Milliseconds,
    /// Delivered together with the first byte
    first_window_bytes: f64,
    /// Window of the first round after the first byte
    round_window_bytes: f64,
    rtt: Milliseconds,
    /// Bytes per millisecond
    rate_cap: f64,
    total_bytes: f64,
}

impl DownloadCurve {
    /// Time after the first byte until `bytes` more have arrived.
    fn transfer_time(&self, bytes: f64) -> Milliseconds {
        if bytes <= 0.0 {
            return 0.0;
        }
        if self.rtt == 0.0 {
            return if self.rate_cap.is_infinite() { 0.0 } else { bytes / self.rate_cap };
        }
        let mut elapsed = 0.0;
        let mut remaining = bytes;
        let mut window = self.round_window_bytes;
        loop {
            let rate = window / self.rtt;
            if rate >= self.rate_cap {
                return elapsed + remaining / self.rate_cap;
            }
            if window >= remaining {
                return elapsed + remaining / rate;
            }
            remaining -= window;
            elapsed += self.rtt;
            window *= 2.0;
        }
    }

    fn total_time(&self) -> Milliseconds {
        self.time_to_first_byte + self.transfer_time(self.total_bytes - self.first_window_bytes)
    }

    /// Bytes received `time` after the request started.
    fn bytes_at(&self, time: Milliseconds) -> f64 {
        if time < self.time_to_first_byte || self.total_bytes <= 0.0 {
            return 0.0;
        }
        let mut received = self.first_window_bytes;
        let mut left = time - self.time_to_first_byte;
        if self.rtt == 0.0 {
            if self.rate_cap.is_infinite() {
                return self.total_bytes;
            }
            return (received + left * self.rate_cap).min(self.total_bytes);
        }
        let mut window = self.round_window_bytes;
        while left > 0.0 && received < self.total_bytes {
            let rate = window / self.rtt;
            if rate >= self.rate_cap {
                received += left * self.rate_cap;
                break;
            }
            let step = left.min(self.rtt);
            received += rate * step;
            left -= step;
            window *= 2.0;
        }
        received.min(self.total_bytes)
    }
}

/// One simulated socket to an origin.
#[derive(Clone, Debug, PartialEq)]
pub struct TcpConnection {
    warmed: bool,
    ssl: bool,
    h2: bool,
    rtt: Milliseconds,
    /// Bits per second
    throughput: f64,
    server_latency: Milliseconds,
    congestion_window: u64,
    h2_overflow_bytes_downloaded: f64,
}

impl TcpConnection {
    pub fn new(rtt: Milliseconds, throughput: f64, server_latency: Milliseconds, ssl: bool, h2: bool) -> Self {
        Self {
            warmed: false,
            ssl,
            h2,
            rtt,
            throughput,
            server_latency,
            congestion_window: INITIAL_CONGESTION_WINDOW,
            h2_overflow_bytes_downloaded: 0.0,
        }
    }

    pub fn set_throughput(&mut self, throughput: f64) {
        self.throughput = throughput;
    }

    pub fn set_congestion_window(&mut self, congestion_window: u64) {
        self.congestion_window = congestion_window.max(1);
    }

    pub fn set_warmed(&mut self, warmed: bool) {
        self.warmed = warmed;
    }

    /// Overflow bytes only carry over on multiplexed connections.
    pub fn set_h2_overflow_bytes_downloaded(&mut self, bytes: f64) {
        if self.h2 {
            self.h2_overflow_bytes_downloaded = bytes;
        }
    }

    pub fn is_warm(&self) -> bool {
        self.warmed
    }

    pub fn is_h2(&self) -> bool {
        self.h2
    }

    pub fn is_ssl(&self) -> bool {
        self.ssl
    }

    pub fn congestion_window(&self) -> u64 {
        self.congestion_window
    }

    /// Payload still owed after bytes already pushed on a warm h2 stream.
    fn bytes_owed(&self, bytes: f64) -> f64 {
        if self.warmed && self.h2 {
            bytes - self.h2_overflow_bytes_downloaded
        } else {
            bytes
        }
    }

    /// Whether a window rides along with the first byte of the response.
    fn sends_window_with_first_byte(&self) -> bool {
        !(self.warmed && self.h2)
    }

    /// Windows sent to deliver `bytes`, doubling from the current window.
    ///
    /// Depends only on the payload, never on rtt or throughput.
    pub fn window_growth(&self, bytes: f64) -> WindowGrowth {
        let bytes = self.bytes_owed(bytes);
        let mut congestion_window = self.congestion_window.max(1);
        let mut windows = 0;
        let mut sent = 0.0;
        while sent < bytes {
            if windows > 0 {
                congestion_window = congestion_window.saturating_mul(2);
            }
            windows += 1;
            sent += congestion_window as f64 * TCP_SEGMENT_SIZE;
        }
        WindowGrowth {
            windows,
            congestion_window,
            extra_bytes: if self.h2 { (sent - bytes).max(0.0) } else { 0.0 },
        }
    }

    /// Applies the state left behind by a finished download of `bytes`.
    pub fn complete_download(&mut self, bytes: f64) {
        let growth = self.window_growth(bytes);
        self.congestion_window = growth.congestion_window;
        self.set_h2_overflow_bytes_downloaded(growth.extra_bytes);
        self.warmed = true;
    }

    /// Handshake and request time, then time to first byte.
    fn time_to_first_byte(&self, dns_resolution_time: Milliseconds) -> (Milliseconds, Milliseconds) {
        let one_way_latency = self.rtt / 2.0;
        let ssl_time = if self.ssl { self.rtt } else { 0.0 };
        let handshake_and_request = if self.warmed {
            one_way_latency
        } else {
            dns_resolution_time + 3.0 * one_way_latency + ssl_time
        };
        let time_to_first_byte = if self.warmed && self.h2 {
            0.0
        } else {
            handshake_and_request + self.server_latency + one_way_latency
        };
        (handshake_and_request, time_to_first_byte)
    }

    fn curve(&self, bytes: f64, time_to_first_byte: Milliseconds) -> DownloadCurve {
        let window_bytes = self.congestion_window.max(1) as f64 * TCP_SEGMENT_SIZE;
        let rate_cap = self.throughput / 8.0 / 1000.0;
        let (first_window_bytes, round_window_bytes) = if !self.sends_window_with_first_byte() {
            (0.0, window_bytes)
        } else if self.rtt == 0.0 {
            (0.0, 2.0 * window_bytes)
        } else {
            // never more than the throughput delivers in one round trip
            (window_bytes.min(rate_cap * self.rtt), 2.0 * window_bytes)
        };
        DownloadCurve {
            time_to_first_byte,
            first_window_bytes,
            round_window_bytes,
            rtt: self.rtt,
            rate_cap,
            total_bytes: self.bytes_owed(bytes),
        }
    }

    /// Simulates the request for `bytes` from `time_already_elapsed` on.
    ///
    /// Time is measured from the start of the request. Does not mutate the
    /// connection; callers apply [`TcpConnection::complete_download`] once the
    /// request completes.
    pub fn simulate_download_until(&self, bytes: f64, options: DownloadOptions) -> DownloadResult {
        let DownloadOptions {
            time_already_elapsed,
            maximum_time_to_elapse,
            dns_resolution_time,
        } = options;

        let (handshake_and_request, time_to_first_byte) = self.time_to_first_byte(dns_resolution_time);
        let curve = self.curve(bytes, time_to_first_byte);
        let total_time = curve.total_time();

        let time_remaining = (total_time - time_already_elapsed).max(0.0);
        let finishes = time_remaining <= maximum_time_to_elapse;
        let time_elapsed = if finishes { time_remaining } else { maximum_time_to_elapse.max(0.0) };
        let received_before = if time_already_elapsed >= total_time {
            curve.total_bytes.max(0.0)
        } else {
            curve.bytes_at(time_already_elapsed)
        };
        let received_after = if finishes {
            curve.total_bytes.max(0.0)
        } else {
            curve.bytes_at(time_already_elapsed + time_elapsed)
        };
        let bytes_downloaded = (received_after - received_before).max(0.0);

        let growth = self.window_growth(bytes);
        let handshake_round_trips = if self.rtt > 0.0 && time_to_first_byte > 0.0 {
            (handshake_and_request / self.rtt).ceil() as u32
        } else {
            0
        };
        let download_round_trips = if self.sends_window_with_first_byte() {
            growth.windows.saturating_sub(1)
        } else {
            growth.windows
        };

        let download_time = total_time - time_to_first_byte;
        let connection_timing = if !self.warmed {
            ConnectionTiming {
                dns_resolution_time: Some(dns_resolution_time),
                connection_time: Some(handshake_and_request - dns_resolution_time),
                ssl_time: self.ssl.then_some(self.rtt),
                time_to_first_byte,
                download_time,
            }
        } else if self.h2 {
            ConnectionTiming {
                time_to_first_byte,
                download_time,
                ..Default::default()
            }
        } else {
            ConnectionTiming {
                connection_time: Some(handshake_and_request),
                time_to_first_byte,
                download_time,
                ..Default::default()
            }
        };

        DownloadResult {
            round_trips: handshake_round_trips.saturating_add(download_round_trips),
            time_elapsed,
            bytes_downloaded,
            extra_bytes_downloaded: growth.extra_bytes,
            congestion_window: growth.congestion_window,
            connection_timing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FAST: f64 = 1e12;

    #[test]
    fn test_cold_small_download() {
        let conn = TcpConnection::new(100.0, FAST, 0.0, false, false);
        let result = conn.simulate_download_until(1000.0, DownloadOptions::default());
        assert_eq!(result.round_trips, 2);
        assert_eq!(result.time_elapsed, 200.0);
        assert_eq!(result.bytes_downloaded, 1000.0);
        assert_eq!(result.congestion_window, 10);
        assert_eq!(result.connection_timing.connection_time, Some(150.0));
        assert_eq!(result.connection_timing.ssl_time, None);
        assert_eq!(result.connection_timing.download_time, 0.0);
    }

    #[test]
    fn test_ssl_adds_round_trip() {
        let conn = TcpConnection::new(100.0, FAST, 0.0, true, false);
        let result = conn.simulate_download_until(1000.0, DownloadOptions::default());
        assert_eq!(result.time_elapsed, 300.0);
        assert_eq!(result.connection_timing.ssl_time, Some(100.0));
    }

    #[test]
    fn test_server_latency_and_dns() {
        let conn = TcpConnection::new(100.0, FAST, 50.0, false, false);
        let options = DownloadOptions {
            dns_resolution_time: 200.0,
            ..Default::default()
        };
        let result = conn.simulate_download_until(1000.0, options);
        assert_eq!(result.time_elapsed, 450.0);
        assert_eq!(result.connection_timing.dns_resolution_time, Some(200.0));
        assert_eq!(result.connection_timing.connection_time, Some(150.0));
    }

    #[test]
    fn test_warm_connections() {
        let mut h1 = TcpConnection::new(100.0, FAST, 0.0, true, false);
        h1.set_warmed(true);
        let result = h1.simulate_download_until(1000.0, DownloadOptions::default());
        assert_eq!(result.time_elapsed, 100.0);
        assert_eq!(result.connection_timing.connection_time, Some(50.0));

        let mut h2 = TcpConnection::new(100.0, FAST, 0.0, true, true);
        h2.set_warmed(true);
        let result = h2.simulate_download_until(14_600.0, DownloadOptions::default());
        assert_eq!(result.connection_timing.time_to_first_byte, 0.0);
        assert_eq!(result.connection_timing.connection_time, None);
        // one full window at 146 bytes per millisecond
        assert_eq!(result.time_elapsed, 100.0);
    }

    #[test]
    fn test_slow_start_growth() {
        let conn = TcpConnection::new(100.0, FAST, 0.0, false, false);
        // 14600 bytes with the first byte, then windows of 20 and 40 segments
        let result = conn.simulate_download_until(102_200.0, DownloadOptions::default());
        assert_eq!(result.round_trips, 4);
        assert_eq!(result.time_elapsed, 400.0);
        assert_eq!(result.congestion_window, 40);
        assert_eq!(result.bytes_downloaded, 102_200.0);

        // half of the last window takes half of its round trip
        let partial = conn.simulate_download_until(73_000.0, DownloadOptions::default());
        assert_eq!(partial.time_elapsed, 350.0);
        assert_eq!(partial.congestion_window, 40);
    }

    #[test]
    fn test_rate_capped_by_throughput() {
        // 8 segments per round trip
        let throughput = 8.0 * TCP_SEGMENT_SIZE * 8.0 * 10.0;
        let conn = TcpConnection::new(100.0, throughput, 0.0, false, false);

        let bytes = 8.0 * TCP_SEGMENT_SIZE * 9.0;
        let result = conn.simulate_download_until(bytes, DownloadOptions::default());
        // 8 segments ride with the first byte, then 8 more per round trip
        assert!((result.time_elapsed - 1000.0).abs() < 1e-6);
        // the carried window does not depend on throughput
        let unthrottled = TcpConnection::new(100.0, FAST, 0.0, false, false);
        assert_eq!(result.congestion_window, unthrottled.window_growth(bytes).congestion_window);
    }

    #[test]
    fn test_maximum_time_limits_progress() {
        let conn = TcpConnection::new(100.0, FAST, 0.0, false, false);
        let options = DownloadOptions {
            maximum_time_to_elapse: 250.0,
            ..Default::default()
        };
        let result = conn.simulate_download_until(1_000_000.0, options);
        assert_eq!(result.time_elapsed, 250.0);
        // the first window, then half of the 20 segment round
        assert_eq!(result.bytes_downloaded, 29_200.0);

        let rest = conn.simulate_download_until(
            1_000_000.0,
            DownloadOptions {
                time_already_elapsed: 250.0,
                ..Default::default()
            },
        );
        assert_eq!(rest.bytes_downloaded, 1_000_000.0 - 29_200.0);
    }

    #[test]
    fn test_window_growth() {
        let conn = TcpConnection::new(100.0, FAST, 0.0, false, false);
        let growth = conn.window_growth(50_000.0);
        assert_eq!(growth.windows, 3);
        assert_eq!(growth.congestion_window, 40);
        assert_eq!(growth.extra_bytes, 0.0);

        let mut reused = conn.clone();
        reused.complete_download(50_000.0);
        assert!(reused.is_warm());
        assert_eq!(reused.congestion_window(), 40);
        assert_eq!(conn.window_growth(0.0).congestion_window, INITIAL_CONGESTION_WINDOW);
    }

    #[test]
    fn test_h2_extra_bytes_and_overflow() {
        let mut conn = TcpConnection::new(100.0, FAST, 0.0, false, true);
        let result = conn.simulate_download_until(1000.0, DownloadOptions::default());
        assert_eq!(result.extra_bytes_downloaded, 14_600.0 - 1000.0);

        conn.complete_download(1000.0);
        let next = conn.simulate_download_until(2000.0, DownloadOptions::default());
        assert_eq!(next.bytes_downloaded, 0.0);
        assert_eq!(next.time_elapsed, 0.0);

        let mut h1 = TcpConnection::new(100.0, FAST, 0.0, false, false);
        h1.set_h2_overflow_bytes_downloaded(500.0);
        assert_eq!(h1.simulate_download_until(1000.0, DownloadOptions::default()).extra_bytes_downloaded, 0.0);
    }

    #[test]
    fn test_zero_rtt_infinite_throughput() {
        let conn = TcpConnection::new(0.0, f64::INFINITY, 100.0, true, false);
        let result = conn.simulate_download_until(50_000.0, DownloadOptions::default());
        assert_eq!(result.time_elapsed, 100.0);
        assert_eq!(result.bytes_downloaded, 50_000.0);
    }

    #[test]
    fn test_slower_network_never_finishes_sooner() {
        for (warm, h2) in [(false, false), (true, false), (true, true)] {
            let mut previous = 0.0;
            for rtt in [0.0, 10.0, 40.0, 100.0, 250.0] {
                let mut conn = TcpConnection::new(rtt, 2_000_000.0, 20.0, true, h2);
                conn.set_warmed(warm);
                let time = conn.simulate_download_until(120_000.0, DownloadOptions::default()).time_elapsed;
                assert!(time + 1e-9 >= previous, "rtt {rtt} warm {warm} h2 {h2}: {time} < {previous}");
                previous = time;
            }
        }
    }
}
