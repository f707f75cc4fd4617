// Copyright (c) 2024 The Flowsteer Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The cubic window function: a pure function of the time since the last
//! congestion event, independent of packet bookkeeping.

use std::time::Duration;
use std::time::Instant;

use log::*;

use super::CubicAlgorithm;

/// Fixed-point time scale exponent. Offsets from the epoch are measured in
/// 2^10 fractions of a second instead of milliseconds, which allows a right
/// shift to stand in for the division of the cubic term.
/// 2^40 = 1024 * (1024 ms scaling round trip)^3.
const CUBE_SCALE: u32 = 40;

/// Numerator of the cubic coefficient C in the fixed-point evaluation
/// (0.4 datagrams per (1/1024 s)^3 once divided out by `CUBE_SCALE`).
const CUBE_CONGESTION_WINDOW_SCALE: u64 = 410;

/// Default multiplicative window decrease on loss for a single emulated
/// connection, before the N-connection emulation is applied.
const DEFAULT_BACKOFF_FACTOR: f32 = 0.7;

/// The plain cubic window function.
///
/// All window values are byte counts. The curve holds no packet numbers:
/// the sender feeds it acked byte counts and event times and applies the
/// returned targets to its own window state.
#[derive(Debug)]
pub struct CubicCurve {
    /// Number of emulated TCP connections sharing the window.
    num_connections: usize,

    /// Max datagram size in bytes.
    max_datagram_size: u64,

    /// Raw backoff factor; the coordinator may override it.
    backoff_factor: f32,

    /// Start of the current loss-free interval. `None` means no ack has been
    /// observed since the last loss event.
    epoch: Option<Instant>,

    /// Window size in bytes just before the last loss event, with the fast
    /// convergence adjustment applied.
    last_max_congestion_window: u64,

    /// Bytes acked since the epoch started.
    acked_bytes_count: u64,

    /// Estimate of the window a TCP Reno flow would have reached, grown by
    /// alpha * MSS per estimated window of acked bytes.
    estimated_tcp_congestion_window: u64,

    /// Origin point (inflection) of the cubic function in bytes.
    origin_point_congestion_window: u64,

    /// Time from epoch to the origin point, in 2^10 fractions of a second.
    time_to_origin_point: u32,

    /// Last target window computed by the ack-driven update.
    last_target_congestion_window: u64,
}

impl CubicCurve {
    pub fn new(max_datagram_size: u64, num_connections: usize) -> Self {
        Self {
            num_connections: num_connections.max(1),
            max_datagram_size,
            backoff_factor: DEFAULT_BACKOFF_FACTOR,
            epoch: None,
            last_max_congestion_window: 0,
            acked_bytes_count: 0,
            estimated_tcp_congestion_window: 0,
            origin_point_congestion_window: 0,
            time_to_origin_point: 0,
            last_target_congestion_window: 0,
        }
    }

    /// Multiplicative window decrease emulating the effective backoff of an
    /// ensemble of N TCP connections on a single loss event.
    fn beta(&self) -> f32 {
        let n = self.num_connections as f32;
        (n - 1.0 + self.backoff_factor) / n
    }

    /// Additional backoff applied to the pre-loss maximum when the window
    /// never reached it again, giving way to a competing flow.
    fn beta_last_max(&self) -> f32 {
        let raw = 1.0 - (1.0 - self.backoff_factor) / 2.0;
        let n = self.num_connections as f32;
        (n - 1.0 + raw) / n
    }

    /// Reno-friendly additive increase factor. Uses the default backoff for
    /// the fairness calculation even when the coordinator overrides beta.
    fn alpha(&self) -> f32 {
        let b = DEFAULT_BACKOFF_FACTOR;
        let n = self.num_connections as f32;
        3.0 * n * n * (1.0 - b) / (1.0 + b)
    }

    /// K^3 scaling constant of the fixed-point cubic evaluation.
    fn cube_factor(&self) -> u64 {
        (1u64 << CUBE_SCALE) / CUBE_CONGESTION_WINDOW_SCALE / self.max_datagram_size.max(1)
    }

    /// Override the raw backoff factor used by [`Self::beta`] and
    /// [`Self::beta_last_max`] from this point on.
    pub(super) fn set_backoff_factor(&mut self, backoff_factor: f32) {
        if backoff_factor > 0.0 && backoff_factor <= 1.0 {
            self.backoff_factor = backoff_factor;
        } else {
            warn!("ignoring out-of-range backoff factor {}", backoff_factor);
        }
    }

    /// Fold a signed coordinator delta into the recorded pre-loss maximum.
    pub(super) fn adjust_last_max_congestion_window(&mut self, delta: i64) {
        self.last_max_congestion_window = add_signed(self.last_max_congestion_window, delta);
    }

    pub(super) fn last_max_congestion_window(&self) -> u64 {
        self.last_max_congestion_window
    }
}

/// Saturating signed adjustment of an unsigned byte count.
pub(super) fn add_signed(value: u64, delta: i64) -> u64 {
    if delta >= 0 {
        value.saturating_add(delta as u64)
    } else {
        value.saturating_sub(delta.unsigned_abs())
    }
}

impl CubicAlgorithm for CubicCurve {
    fn reset(&mut self) {
        self.epoch = None;
        self.last_max_congestion_window = 0;
        self.acked_bytes_count = 0;
        self.estimated_tcp_congestion_window = 0;
        self.origin_point_congestion_window = 0;
        self.time_to_origin_point = 0;
        self.last_target_congestion_window = 0;
    }

    fn on_application_limited(&mut self) {
        // Cubic assumes the sender used the entire window since the epoch
        // began. Application-limited periods break that assumption, so the
        // epoch restarts on the next ack, freezing time-based growth while
        // the window sits idle.
        self.epoch = None;
    }

    fn congestion_window_after_packet_loss(&mut self, current_congestion_window: u64) -> u64 {
        if current_congestion_window.saturating_add(self.max_datagram_size)
            < self.last_max_congestion_window
        {
            // The window never recovered to the old maximum; assume an unseen
            // competing flow and back the recorded maximum off further.
            self.last_max_congestion_window =
                (self.beta_last_max() * current_congestion_window as f32) as u64;
        } else {
            self.last_max_congestion_window = current_congestion_window;
        }
        self.epoch = None;

        (current_congestion_window as f32 * self.beta()) as u64
    }

    fn congestion_window_after_ack(
        &mut self,
        acked_bytes: u64,
        current_congestion_window: u64,
        delay_min: Duration,
        event_time: Instant,
    ) -> u64 {
        self.acked_bytes_count = self.acked_bytes_count.saturating_add(acked_bytes);

        let epoch = if let Some(epoch) = self.epoch {
            epoch
        } else {
            // First ack after a loss event starts a new epoch.
            trace!("cubic epoch starts, cwnd={}", current_congestion_window);
            self.epoch = Some(event_time);
            self.acked_bytes_count = acked_bytes;
            self.estimated_tcp_congestion_window = current_congestion_window;
            if self.last_max_congestion_window <= current_congestion_window {
                self.time_to_origin_point = 0;
                self.origin_point_congestion_window = current_congestion_window;
            } else {
                self.time_to_origin_point = ((self.cube_factor()
                    * (self.last_max_congestion_window - current_congestion_window))
                    as f64)
                    .cbrt() as u32;
                self.origin_point_congestion_window = self.last_max_congestion_window;
            }
            event_time
        };

        // Elapsed time in 2^10 fractions of a second, with the min RTT added
        // as a lookahead term.
        let since_epoch = event_time.saturating_duration_since(epoch);
        let elapsed_time =
            ((since_epoch + delay_min).as_micros() as i64).saturating_mul(1024) / 1_000_000;

        // Force the offset positive; the polynomial is symmetric around the
        // origin point.
        let offset = (self.time_to_origin_point as i64 - elapsed_time).unsigned_abs() as u128;

        let delta_congestion_window = ((CUBE_CONGESTION_WINDOW_SCALE as u128
            * offset
            * offset
            * offset
            * self.max_datagram_size as u128)
            >> CUBE_SCALE)
            .min(u64::MAX as u128) as u64;

        let target_congestion_window = if elapsed_time > self.time_to_origin_point as i64 {
            self.origin_point_congestion_window
                .saturating_add(delta_congestion_window)
        } else {
            self.origin_point_congestion_window
                .saturating_sub(delta_congestion_window)
        };

        // Limit the window increase to half the acked bytes.
        let target_congestion_window = target_congestion_window
            .min(current_congestion_window.saturating_add(self.acked_bytes_count / 2));

        // Grow the Reno-equivalent estimate by roughly alpha * MSS per
        // estimated window of acked bytes.
        let estimated = self.estimated_tcp_congestion_window.max(1);
        self.estimated_tcp_congestion_window = estimated.saturating_add(
            (self.acked_bytes_count as f32 * self.alpha() * self.max_datagram_size as f32
                / estimated as f32) as u64,
        );
        self.acked_bytes_count = 0;

        self.last_target_congestion_window = target_congestion_window;
        trace!(
            "cubic target {} reno estimate {}",
            self.last_target_congestion_window,
            self.estimated_tcp_congestion_window
        );

        // Cubic never grows slower than the Reno-equivalent flow would.
        target_congestion_window.max(self.estimated_tcp_congestion_window)
    }

    fn set_num_connections(&mut self, n: usize) {
        self.num_connections = n.max(1);
    }

    fn set_max_datagram_size(&mut self, max_datagram_size: u64) {
        self.max_datagram_size = max_datagram_size;
    }
}
