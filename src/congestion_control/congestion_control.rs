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

use core::str::FromStr;
use std::fmt;
use std::time::Duration;
use std::time::Instant;

use crate::Bandwidth;
use crate::Error;
use crate::Result;
use crate::SenderConfig;
pub use control::ControlHandle;
pub use control::ControlledCubicSender;
pub use cubic::CubicCurve;
pub use hystart::HybridSlowStart;
pub use sender::CubicSender;
pub use signal::SignalObserver;
pub use signal::SignalQueue;

/// Available congestion control algorithm.
#[derive(Eq, PartialEq, Debug, Clone, Copy, Default)]
pub enum CongestionControlAlgorithm {
    /// CUBIC uses a cubic function of the time since the last congestion
    /// event instead of a linear window increase function to improve
    /// scalability under fast and long-distance networks.
    #[default]
    Cubic,

    /// Classic NewReno-style linear growth with multiplicative decrease,
    /// driven by the same window state machine.
    Reno,
}

impl FromStr for CongestionControlAlgorithm {
    type Err = Error;

    fn from_str(algor: &str) -> Result<CongestionControlAlgorithm> {
        if algor.eq_ignore_ascii_case("cubic") {
            Ok(CongestionControlAlgorithm::Cubic)
        } else if algor.eq_ignore_ascii_case("reno") {
            Ok(CongestionControlAlgorithm::Reno)
        } else {
            Err(Error::InvalidConfig("unknown".into()))
        }
    }
}

/// Congestion control statistics.
#[derive(Debug, Default, Clone)]
pub struct CongestionStats {
    /// Bytes in flight.
    pub bytes_in_flight: u64,

    /// Total bytes sent.
    pub bytes_sent_in_total: u64,

    /// Total bytes sent in slow start.
    pub bytes_sent_in_slow_start: u64,

    /// Total bytes acked.
    pub bytes_acked_in_total: u64,

    /// Total bytes lost.
    pub bytes_lost_in_total: u64,

    /// Total packets acked.
    pub packets_acked_in_total: u64,

    /// Total packets reported lost, including stale reports for an episode
    /// that was already handled.
    pub packets_lost_in_total: u64,
}

impl CongestionStats {
    /// Fraction of packets reported lost over all packets accounted so far.
    pub fn loss_ratio(&self) -> f64 {
        let total = self.packets_acked_in_total + self.packets_lost_in_total;
        if total == 0 {
            return 0.0;
        }
        self.packets_lost_in_total as f64 / total as f64
    }
}

/// The congestion control contract consumed by the transport layer.
///
/// All callbacks are invoked synchronously on the connection's packet
/// processing path; the controller assumes no concurrent mutation through
/// this trait.
pub trait SendAlgorithm {
    /// Name of the congestion control algorithm.
    fn name(&self) -> &str;

    /// The earliest time a further packet may depart, based on the pacing
    /// budget. `None` means the packet may be sent immediately.
    fn time_until_send(&self, bytes_in_flight: u64) -> Option<Instant>;

    /// Whether the pacing budget allows at least one full-sized datagram.
    fn has_pacing_budget(&self, now: Instant) -> bool;

    /// Callback after a packet was sent out.
    fn on_packet_sent(
        &mut self,
        now: Instant,
        bytes_in_flight: u64,
        packet_number: u64,
        bytes: u64,
        is_retransmittable: bool,
    );

    /// Whether the window allows sending more data.
    fn can_send(&self, bytes_in_flight: u64) -> bool;

    /// Feed one RTT sample from the transport's ack processing.
    fn update_rtt(&mut self, latest_rtt: Duration, ack_delay: Duration, now: Instant);

    /// Exit slow start early if the hybrid slow start detector has seen
    /// enough RTT inflation. Called after each RTT update.
    fn maybe_exit_slow_start(&mut self);

    /// Callback for each newly acked packet.
    fn on_packet_acked(
        &mut self,
        packet_number: u64,
        acked_bytes: u64,
        prior_in_flight: u64,
        event_time: Instant,
    );

    /// Callback for each packet declared lost. Idempotent per loss episode:
    /// stale reports for an already-handled window produce no cutback.
    fn on_packet_lost(&mut self, packet_number: u64, lost_bytes: u64, prior_in_flight: u64);

    /// Callback for a retransmission timeout. A no-op unless packets were
    /// actually retransmitted.
    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool);

    /// Reset to initial conditions after the connection migrated to a new
    /// path.
    fn on_connection_migration(&mut self);

    /// Update the maximum datagram size, e.g. after path MTU discovery.
    /// The size never shrinks.
    fn set_max_datagram_size(&mut self, max_datagram_size: u64);

    /// Check if in slow start.
    fn in_slow_start(&self) -> bool;

    /// Check if in recovery, i.e. a loss cutback is pending ack confirmation
    /// beyond the packet that triggered it.
    fn in_recovery(&self) -> bool;

    /// Current congestion window in bytes.
    fn get_congestion_window(&self) -> u64;

    /// Current bandwidth estimate. Infinite before the first RTT sample.
    fn bandwidth_estimate(&self) -> Bandwidth;

    /// Congestion stats.
    fn stats(&self) -> &CongestionStats;
}

impl fmt::Debug for dyn SendAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send algorithm {}.", self.name())
    }
}

/// Pending external window adjustment staged by a coordinator, consumed
/// exactly once at the sender's next window recomputation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WindowAdjustment {
    /// Signed byte delta added to the congestion window, clamped to the
    /// window bounds.
    pub cwnd_delta: i64,

    /// Force one extra multiplicative decrease on the current window before
    /// the delta applies (conservative allocation).
    pub conservative_allocation: bool,
}

/// The cubic window function driven by the sender.
///
/// Implemented by the plain [`CubicCurve`] and by the control-extended
/// variant that folds staged coordinator adjustments into the math; the
/// sender holds either behind this trait and never needs to know which.
pub trait CubicAlgorithm {
    /// Zero all history, e.g. on retransmission timeout or migration.
    fn reset(&mut self);

    /// Freeze growth accounting while the sender is not using the available
    /// window.
    fn on_application_limited(&mut self);

    /// Compute the window to use after a loss event; a multiplicative
    /// decrease of `current_congestion_window`.
    fn congestion_window_after_packet_loss(&mut self, current_congestion_window: u64) -> u64;

    /// Compute the target window after a received ack, following the cubic
    /// polynomial of the time since the last loss event.
    fn congestion_window_after_ack(
        &mut self,
        acked_bytes: u64,
        current_congestion_window: u64,
        delay_min: Duration,
        event_time: Instant,
    ) -> u64;

    /// Update the number of emulated TCP connections.
    fn set_num_connections(&mut self, n: usize);

    /// Update the maximum datagram size.
    fn set_max_datagram_size(&mut self, max_datagram_size: u64);

    /// Take the staged external window adjustment, if any. The plain curve
    /// has none.
    fn take_window_adjustment(&mut self) -> Option<WindowAdjustment> {
        None
    }
}

/// The inbound control contract exposed to an external coordinator.
///
/// Both entry points may be invoked from a coordinator thread concurrently
/// with the packet-processing callbacks.
pub trait CongestionControlModifier {
    /// Stage a window-bound adjustment, consumed exactly once at the next
    /// window recomputation. A repeated call overwrites the prior
    /// un-consumed deltas. Always accepted.
    fn apply_control(
        &self,
        beta: f64,
        cwnd_adjust: i64,
        cwnd_max_adjust: i64,
        use_conservative_allocation: bool,
    ) -> bool;

    /// Switch the controller into fixed-rate override mode: the reported
    /// window and bandwidth derive from this rate and the measured smoothed
    /// RTT. Sticky once set.
    fn set_fixed_rate(&self, rate: Bandwidth);
}

/// Build a plain congestion controller without control-signal support.
pub fn build_send_algorithm(conf: &SenderConfig) -> Box<dyn SendAlgorithm> {
    Box::new(CubicSender::new(conf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn congestion_control_name() {
        let cases = [
            ("cubic", Ok(CongestionControlAlgorithm::Cubic)),
            ("Cubic", Ok(CongestionControlAlgorithm::Cubic)),
            ("CUBIC", Ok(CongestionControlAlgorithm::Cubic)),
            ("reno", Ok(CongestionControlAlgorithm::Reno)),
            ("Reno", Ok(CongestionControlAlgorithm::Reno)),
            ("RENO", Ok(CongestionControlAlgorithm::Reno)),
            ("cubci", Err(Error::InvalidConfig("unknown".into()))),
        ];

        for (name, algor) in cases {
            assert_eq!(CongestionControlAlgorithm::from_str(name), algor);
        }
    }

    #[test]
    fn loss_ratio() {
        let mut stats = CongestionStats::default();
        assert_eq!(stats.loss_ratio(), 0.0);

        stats.packets_acked_in_total = 90;
        stats.packets_lost_in_total = 10;
        assert_eq!(stats.loss_ratio(), 0.1);
    }

    #[test]
    fn build_default_controller() {
        let conf = SenderConfig::default();
        let cc = build_send_algorithm(&conf);
        assert_eq!(cc.name(), "CUBIC");
        assert_eq!(cc.get_congestion_window(), 10 * 1200);
        assert!(cc.in_slow_start());
        assert!(!cc.in_recovery());

        let conf = SenderConfig {
            congestion_control_algorithm: CongestionControlAlgorithm::Reno,
            ..SenderConfig::default()
        };
        let cc = build_send_algorithm(&conf);
        assert_eq!(cc.name(), "RENO");
    }
}

mod control;
mod cubic;
mod hystart;
mod pacing;
mod sender;
mod signal;
