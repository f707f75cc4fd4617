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

//! The congestion-window state machine owning the authoritative
//! per-connection window, slow start threshold and phase.

use std::time::Duration;
use std::time::Instant;

use log::*;

use super::cubic::add_signed;
use super::pacing::Pacer;
use super::CongestionControlAlgorithm;
use super::CongestionStats;
use super::CubicAlgorithm;
use super::CubicCurve;
use super::HybridSlowStart;
use super::SendAlgorithm;
use crate::rtt::RttEstimator;
use crate::Bandwidth;
use crate::SenderConfig;

/// Headroom in packets above the bytes in flight beyond which the sender is
/// considered application limited rather than window limited.
const MAX_BURST_PACKETS: u64 = 3;

/// Reno multiplicative decrease factor.
const RENO_BETA: f32 = 0.7;

/// Pacing rate aggressiveness over the raw bandwidth estimate.
const PACING_RATE_NUMERATOR: u64 = 5;
const PACING_RATE_DENOMINATOR: u64 = 4;

/// A loss-based congestion controller: CUBIC or Reno window growth, hybrid
/// slow start and budget-based pacing, with NewReno single-cutback-per-window
/// recovery semantics.
///
/// The phase (slow start / congestion avoidance / recovery / application
/// limited) is derived on each call from the window, the threshold and the
/// recovery predicate; it is never stored.
pub struct CubicSender {
    /// RTT estimation of the connection's path, fed by the transport through
    /// `update_rtt` and consumed read-only everywhere else.
    rtt: RttEstimator,

    /// The window-growth law driven on each ack and loss.
    cubic: Box<dyn CubicAlgorithm>,

    /// Delay-increase detector for leaving slow start before a loss.
    hystart: HybridSlowStart,

    /// Departure smoothing.
    pacer: Pacer,

    /// Use Reno linear growth instead of the cubic law.
    reno: bool,

    /// Max datagram size in bytes.
    max_datagram_size: u64,

    /// Congestion window in bytes.
    congestion_window: u64,

    /// Slow start threshold in bytes. The window grows exponentially below
    /// it.
    slowstart_threshold: u64,

    /// Window bounds in packets; byte values follow the current datagram
    /// size.
    min_congestion_window_packets: u64,
    initial_congestion_window_packets: u64,
    max_congestion_window_packets: u64,

    /// Largest packet number sent so far, if any retransmittable packet was
    /// sent.
    largest_sent_packet_number: Option<u64>,

    /// Largest packet number acked so far.
    largest_acked_packet_number: Option<u64>,

    /// Largest packet number sent when the last loss cutback was taken.
    /// Losses at or below it belong to an already-handled episode.
    largest_sent_at_last_cutback: Option<u64>,

    /// Whether the last cutback ended a slow start phase.
    last_cutback_exited_slowstart: bool,

    /// Acks counted toward the next Reno linear increment; reset on loss.
    num_acked_packets: u64,

    /// Congestion statistics.
    stats: CongestionStats,
}

impl CubicSender {
    pub fn new(conf: &SenderConfig) -> Self {
        let cubic = Box::new(CubicCurve::new(
            conf.max_datagram_size,
            conf.num_emulated_connections,
        ));
        Self::with_cubic(conf, cubic)
    }

    /// Build a sender around a specific window-growth implementation; the
    /// control extension installs its staged variant through this.
    pub(super) fn with_cubic(conf: &SenderConfig, mut cubic: Box<dyn CubicAlgorithm>) -> Self {
        cubic.set_num_connections(conf.num_emulated_connections);
        cubic.set_max_datagram_size(conf.max_datagram_size);

        let initial_window = conf
            .initial_congestion_window
            .saturating_mul(conf.max_datagram_size);
        let max_window = conf
            .max_congestion_window
            .saturating_mul(conf.max_datagram_size);

        Self {
            rtt: RttEstimator::new(conf.initial_rtt),
            cubic,
            hystart: HybridSlowStart::new(conf.enable_hystart),
            pacer: Pacer::new(conf.enable_pacing, initial_window, conf.max_datagram_size),
            reno: conf.congestion_control_algorithm == CongestionControlAlgorithm::Reno,
            max_datagram_size: conf.max_datagram_size,
            congestion_window: initial_window,
            slowstart_threshold: max_window,
            min_congestion_window_packets: conf.min_congestion_window,
            initial_congestion_window_packets: conf.initial_congestion_window,
            max_congestion_window_packets: conf.max_congestion_window,
            largest_sent_packet_number: None,
            largest_acked_packet_number: None,
            largest_sent_at_last_cutback: None,
            last_cutback_exited_slowstart: false,
            num_acked_packets: 0,
            stats: Default::default(),
        }
    }

    /// RTT estimation of the connection's path.
    pub fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    /// Current slow start threshold in bytes.
    pub fn slowstart_threshold(&self) -> u64 {
        self.slowstart_threshold
    }

    pub fn min_congestion_window(&self) -> u64 {
        self.min_congestion_window_packets
            .saturating_mul(self.max_datagram_size)
    }

    pub fn max_congestion_window(&self) -> u64 {
        self.max_congestion_window_packets
            .saturating_mul(self.max_datagram_size)
    }

    fn initial_congestion_window(&self) -> u64 {
        self.initial_congestion_window_packets
            .saturating_mul(self.max_datagram_size)
    }

    pub fn max_datagram_size(&self) -> u64 {
        self.max_datagram_size
    }

    pub(super) fn largest_sent_at_last_cutback(&self) -> Option<u64> {
        self.largest_sent_at_last_cutback
    }

    /// Rate handed to the pacer, slightly above the raw estimate so pacing
    /// does not itself become the bottleneck.
    fn pacing_rate(&self) -> Bandwidth {
        self.bandwidth_estimate()
            .mul_div(PACING_RATE_NUMERATOR, PACING_RATE_DENOMINATOR)
    }

    /// Whether the sender is actually constrained by the window rather than
    /// by the application supplying too little data.
    fn is_cwnd_limited(&self, bytes_in_flight: u64) -> bool {
        let congestion_window = self.get_congestion_window();
        if bytes_in_flight >= congestion_window {
            return true;
        }
        let available_bytes = congestion_window - bytes_in_flight;
        let slow_start_limited = self.in_slow_start() && bytes_in_flight > congestion_window / 2;
        slow_start_limited || available_bytes <= MAX_BURST_PACKETS * self.max_datagram_size
    }

    fn maybe_increase_cwnd(&mut self, acked_bytes: u64, prior_in_flight: u64, event_time: Instant) {
        if !self.is_cwnd_limited(prior_in_flight) {
            // Application limited: freeze growth accounting rather than let
            // idle wall-clock time inflate the cubic target.
            self.cubic.on_application_limited();
            trace!(
                "{} application limited, cwnd={}",
                self.name(),
                self.congestion_window
            );
        } else if self.congestion_window >= self.max_congestion_window() {
            // No growth beyond the ceiling.
        } else if self.in_slow_start() {
            self.congestion_window = self
                .congestion_window
                .saturating_add(self.max_datagram_size);
        } else if self.reno {
            // Classic Reno: one datagram per window of acked packets.
            self.num_acked_packets += 1;
            if self.num_acked_packets >= self.congestion_window / self.max_datagram_size.max(1) {
                self.congestion_window = self
                    .congestion_window
                    .saturating_add(self.max_datagram_size);
                self.num_acked_packets = 0;
            }
        } else {
            self.congestion_window = self.max_congestion_window().min(
                self.cubic.congestion_window_after_ack(
                    acked_bytes,
                    self.congestion_window,
                    self.rtt.min_rtt(),
                    event_time,
                ),
            );
        }

        self.apply_window_adjustment();
    }

    /// Consume a staged external adjustment, if the installed window-growth
    /// implementation carries one. The plain curve never does.
    fn apply_window_adjustment(&mut self) {
        let adjustment = match self.cubic.take_window_adjustment() {
            Some(adjustment) => adjustment,
            None => return,
        };
        debug!(
            "{} applying external window adjustment {:?}",
            self.name(),
            adjustment
        );

        if adjustment.conservative_allocation {
            // One extra multiplicative decrease on the current window before
            // the delta applies.
            self.congestion_window = self
                .cubic
                .congestion_window_after_packet_loss(self.congestion_window);
        }
        if adjustment.cwnd_delta != 0 {
            self.congestion_window = add_signed(self.congestion_window, adjustment.cwnd_delta);
        }
        self.congestion_window = self
            .congestion_window
            .clamp(self.min_congestion_window(), self.max_congestion_window());
    }
}

impl SendAlgorithm for CubicSender {
    fn name(&self) -> &str {
        if self.reno {
            "RENO"
        } else {
            "CUBIC"
        }
    }

    fn time_until_send(&self, _bytes_in_flight: u64) -> Option<Instant> {
        self.pacer.time_until_send(self.pacing_rate())
    }

    fn has_pacing_budget(&self, now: Instant) -> bool {
        self.pacer.has_budget(now, self.pacing_rate())
    }

    fn on_packet_sent(
        &mut self,
        now: Instant,
        bytes_in_flight: u64,
        packet_number: u64,
        bytes: u64,
        is_retransmittable: bool,
    ) {
        let rate = self.pacing_rate();
        self.pacer.on_packet_sent(now, bytes, rate);

        self.stats.bytes_in_flight = bytes_in_flight;
        self.stats.bytes_sent_in_total = self.stats.bytes_sent_in_total.saturating_add(bytes);
        if self.in_slow_start() {
            self.stats.bytes_sent_in_slow_start =
                self.stats.bytes_sent_in_slow_start.saturating_add(bytes);
        }

        if !is_retransmittable {
            return;
        }
        self.largest_sent_packet_number = Some(
            self.largest_sent_packet_number
                .map_or(packet_number, |n| n.max(packet_number)),
        );
        self.hystart.on_packet_sent(packet_number);
    }

    fn can_send(&self, bytes_in_flight: u64) -> bool {
        bytes_in_flight < self.get_congestion_window()
    }

    fn update_rtt(&mut self, latest_rtt: Duration, ack_delay: Duration, _now: Instant) {
        self.rtt.update(ack_delay, latest_rtt);
    }

    fn maybe_exit_slow_start(&mut self) {
        if !self.in_slow_start() {
            return;
        }
        let cwnd_packets = self.congestion_window / self.max_datagram_size.max(1);
        if self.hystart.should_exit_slow_start(
            self.rtt.latest_rtt(),
            self.rtt.min_rtt(),
            cwnd_packets,
        ) {
            debug!(
                "{} leaving slow start on delay increase, cwnd={}",
                self.name(),
                self.congestion_window
            );
            self.slowstart_threshold = self.congestion_window;
        }
    }

    fn on_packet_acked(
        &mut self,
        packet_number: u64,
        acked_bytes: u64,
        prior_in_flight: u64,
        event_time: Instant,
    ) {
        self.largest_acked_packet_number = Some(
            self.largest_acked_packet_number
                .map_or(packet_number, |n| n.max(packet_number)),
        );

        self.stats.bytes_acked_in_total =
            self.stats.bytes_acked_in_total.saturating_add(acked_bytes);
        self.stats.packets_acked_in_total = self.stats.packets_acked_in_total.saturating_add(1);
        self.stats.bytes_in_flight = prior_in_flight.saturating_sub(acked_bytes);

        if self.in_recovery() {
            // Already cutting back; the window does not grow until an ack
            // beyond the cutback point arrives.
            return;
        }
        self.maybe_increase_cwnd(acked_bytes, prior_in_flight, event_time);
        if self.in_slow_start() {
            self.hystart.on_packet_acked(packet_number);
        }
    }

    fn on_packet_lost(&mut self, packet_number: u64, lost_bytes: u64, prior_in_flight: u64) {
        self.stats.bytes_lost_in_total = self.stats.bytes_lost_in_total.saturating_add(lost_bytes);
        self.stats.packets_lost_in_total = self.stats.packets_lost_in_total.saturating_add(1);
        self.stats.bytes_in_flight = prior_in_flight;

        // NewReno semantics: one cutback per window. Losses at or below the
        // largest packet sent when the last cutback was taken belong to the
        // same episode.
        if let Some(cutback) = self.largest_sent_at_last_cutback {
            if packet_number <= cutback {
                trace!(
                    "{} ignoring stale loss of packet {} (cutback at {})",
                    self.name(),
                    packet_number,
                    cutback
                );
                return;
            }
        }

        self.last_cutback_exited_slowstart = self.in_slow_start();
        if self.reno {
            self.congestion_window = (self.congestion_window as f32 * RENO_BETA) as u64;
        } else {
            self.congestion_window = self
                .cubic
                .congestion_window_after_packet_loss(self.congestion_window);
        }
        self.congestion_window = self.congestion_window.max(self.min_congestion_window());
        self.slowstart_threshold = self.congestion_window;
        self.largest_sent_at_last_cutback = self.largest_sent_packet_number;
        self.num_acked_packets = 0;

        debug!(
            "{} loss cutback at packet {}, cwnd={} ssthresh={} exited_slowstart={}",
            self.name(),
            packet_number,
            self.congestion_window,
            self.slowstart_threshold,
            self.last_cutback_exited_slowstart
        );
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.largest_sent_at_last_cutback = None;
        if !packets_retransmitted {
            return;
        }
        self.hystart.restart();
        self.cubic.reset();
        self.slowstart_threshold = self.congestion_window / 2;
        self.congestion_window = self.min_congestion_window();
        debug!(
            "{} retransmission timeout, cwnd={} ssthresh={}",
            self.name(),
            self.congestion_window,
            self.slowstart_threshold
        );
    }

    /// Reset to initial conditions, as if the connection were new. RTT
    /// history survives; the path may be the same one.
    fn on_connection_migration(&mut self) {
        self.hystart.restart();
        self.cubic.reset();
        self.largest_sent_packet_number = None;
        self.largest_acked_packet_number = None;
        self.largest_sent_at_last_cutback = None;
        self.last_cutback_exited_slowstart = false;
        self.num_acked_packets = 0;
        self.congestion_window = self.initial_congestion_window();
        self.slowstart_threshold = self.max_congestion_window();
        debug!("{} connection migrated, controller reset", self.name());
    }

    fn set_max_datagram_size(&mut self, max_datagram_size: u64) {
        if max_datagram_size < self.max_datagram_size {
            warn!(
                "ignoring max datagram size decrease from {} to {}",
                self.max_datagram_size, max_datagram_size
            );
            return;
        }
        let cwnd_was_min = self.congestion_window == self.min_congestion_window();
        self.max_datagram_size = max_datagram_size;
        if cwnd_was_min {
            self.congestion_window = self.min_congestion_window();
        }
        self.pacer.set_max_datagram_size(max_datagram_size);
        self.cubic.set_max_datagram_size(max_datagram_size);
    }

    fn in_slow_start(&self) -> bool {
        self.congestion_window < self.slowstart_threshold
    }

    fn in_recovery(&self) -> bool {
        match (
            self.largest_acked_packet_number,
            self.largest_sent_at_last_cutback,
        ) {
            (Some(acked), Some(cutback)) => acked <= cutback,
            _ => false,
        }
    }

    fn get_congestion_window(&self) -> u64 {
        self.congestion_window
    }

    /// Current bandwidth estimate: one congestion window per smoothed RTT.
    /// Infinite before the first RTT sample.
    fn bandwidth_estimate(&self) -> Bandwidth {
        if !self.rtt.has_sample() {
            return Bandwidth::INFINITE;
        }
        Bandwidth::from_delta(self.get_congestion_window(), self.rtt.smoothed_rtt())
    }

    fn stats(&self) -> &CongestionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u64 = 1200;

    fn new_sender(algor: CongestionControlAlgorithm) -> CubicSender {
        let conf = SenderConfig {
            congestion_control_algorithm: algor,
            ..SenderConfig::default()
        };
        CubicSender::new(&conf)
    }

    /// Drive `n` cwnd-limited acks through the sender.
    fn ack_n(sender: &mut CubicSender, first_pkt: u64, n: u64, now: Instant) {
        for i in 0..n {
            let in_flight = sender.get_congestion_window();
            sender.on_packet_acked(first_pkt + i, MSS, in_flight, now);
        }
    }

    #[test]
    fn slow_start_grows_one_datagram_per_ack() {
        let mut sender = new_sender(CongestionControlAlgorithm::Cubic);
        let now = Instant::now();
        let initial = sender.get_congestion_window();
        assert_eq!(initial, 10 * MSS);
        assert!(sender.in_slow_start());

        for i in 0..20 {
            sender.on_packet_sent(now, i * MSS, i, MSS, true);
        }
        // 20 consecutive cwnd-limited acks each grow the window by exactly
        // one datagram.
        for i in 0..20 {
            let before = sender.get_congestion_window();
            sender.on_packet_acked(i, MSS, before, now);
            assert_eq!(sender.get_congestion_window(), before + MSS);
            assert!(sender.in_slow_start());
        }
        assert_eq!(sender.get_congestion_window(), initial + 20 * MSS);
    }

    #[test]
    fn window_bounds_invariant() {
        let conf = SenderConfig {
            max_congestion_window: 15,
            ..SenderConfig::default()
        };
        let mut sender = CubicSender::new(&conf);
        let now = Instant::now();

        for i in 0..100u64 {
            sender.on_packet_sent(now, 0, i, MSS, true);
            let in_flight = sender.get_congestion_window();
            sender.on_packet_acked(i, MSS, in_flight, now);
            let cwnd = sender.get_congestion_window();
            assert!(cwnd >= sender.min_congestion_window());
            assert!(cwnd <= sender.max_congestion_window());
        }
        // The ceiling held.
        assert_eq!(sender.get_congestion_window(), 15 * MSS);

        // Repeated losses floor at the minimum window.
        for i in 100..140u64 {
            sender.on_packet_sent(now, 0, i, MSS, true);
            sender.on_packet_acked(i, MSS, sender.get_congestion_window(), now);
            sender.on_packet_lost(i, MSS, MSS);
            assert!(sender.get_congestion_window() >= sender.min_congestion_window());
        }
    }

    #[test]
    fn loss_is_idempotent_per_episode() {
        let mut sender = new_sender(CongestionControlAlgorithm::Cubic);
        let now = Instant::now();

        for i in 0..10 {
            sender.on_packet_sent(now, i * MSS, i, MSS, true);
        }
        let before = sender.get_congestion_window();
        sender.on_packet_lost(3, MSS, 10 * MSS);
        let after = sender.get_congestion_window();
        assert!(after < before);
        assert_eq!(sender.slowstart_threshold(), after);

        // Further losses from the same window change nothing.
        sender.on_packet_lost(4, MSS, 9 * MSS);
        sender.on_packet_lost(9, MSS, 8 * MSS);
        assert_eq!(sender.get_congestion_window(), after);

        // A loss beyond the cutback point opens a new episode.
        sender.on_packet_sent(now, 0, 20, MSS, true);
        sender.on_packet_lost(20, MSS, MSS);
        assert!(sender.get_congestion_window() < after);
    }

    #[test]
    fn loss_then_recovery_scenario() {
        let conf = SenderConfig::default();
        let mut sender = CubicSender::new(&conf);
        let now = Instant::now();

        // Grow the window to 100_000 bytes, then report a loss at packet N.
        sender.congestion_window = 100_000;
        for i in 0..50 {
            sender.on_packet_sent(now, i * MSS, i, MSS, true);
        }
        let n = 49;
        sender.on_packet_lost(n, MSS, 50 * MSS);

        // Cubic multiplicative decrease with two emulated connections.
        let expected = (100_000_f32 * 0.85) as u64;
        assert_eq!(sender.get_congestion_window(), expected);
        assert_eq!(sender.slowstart_threshold(), expected);

        // Acks at or below N hold the sender in recovery without growth.
        for i in 40..=n {
            sender.on_packet_acked(i, MSS, expected, now);
            assert!(sender.in_recovery());
            assert_eq!(sender.get_congestion_window(), expected);
        }

        // An ack beyond N leaves recovery and growth resumes.
        sender.on_packet_sent(now, 0, n + 1, MSS, true);
        sender.on_packet_acked(n + 1, MSS, expected, now);
        assert!(!sender.in_recovery());
    }

    #[test]
    fn application_limited_freezes_growth() {
        let mut sender = new_sender(CongestionControlAlgorithm::Cubic);
        let now = Instant::now();

        sender.on_packet_sent(now, 0, 1, MSS, true);
        let before = sender.get_congestion_window();
        // One packet in flight against a ten-packet window: application
        // limited, no growth.
        sender.on_packet_acked(1, MSS, MSS, now);
        assert_eq!(sender.get_congestion_window(), before);
    }

    #[test]
    fn reno_congestion_avoidance_linear_growth() {
        let mut sender = new_sender(CongestionControlAlgorithm::Reno);
        let now = Instant::now();

        // Force congestion avoidance.
        sender.slowstart_threshold = sender.congestion_window;
        assert!(!sender.in_slow_start());

        let cwnd = sender.get_congestion_window();
        let acks_per_increment = cwnd / MSS;
        for i in 0..acks_per_increment - 1 {
            sender.on_packet_sent(now, 0, i, MSS, true);
            sender.on_packet_acked(i, MSS, cwnd, now);
            assert_eq!(sender.get_congestion_window(), cwnd);
        }
        sender.on_packet_sent(now, 0, acks_per_increment, MSS, true);
        sender.on_packet_acked(acks_per_increment, MSS, cwnd, now);
        assert_eq!(sender.get_congestion_window(), cwnd + MSS);
    }

    #[test]
    fn reno_loss_backoff() {
        let mut sender = new_sender(CongestionControlAlgorithm::Reno);
        let now = Instant::now();

        sender.congestion_window = 100_000;
        sender.on_packet_sent(now, 0, 1, MSS, true);
        sender.on_packet_lost(1, MSS, 100_000);
        assert_eq!(sender.get_congestion_window(), (100_000_f32 * 0.7) as u64);
    }

    #[test]
    fn retransmission_timeout() {
        let mut sender = new_sender(CongestionControlAlgorithm::Cubic);
        let now = Instant::now();
        ack_n(&mut sender, 0, 5, now);
        let cwnd = sender.get_congestion_window();

        // Without retransmitted packets the timeout is a no-op.
        sender.on_retransmission_timeout(false);
        assert_eq!(sender.get_congestion_window(), cwnd);

        sender.on_retransmission_timeout(true);
        assert_eq!(
            sender.get_congestion_window(),
            sender.min_congestion_window()
        );
        assert_eq!(sender.slowstart_threshold(), cwnd / 2);
    }

    #[test]
    fn connection_migration_resets() {
        let mut sender = new_sender(CongestionControlAlgorithm::Cubic);
        let now = Instant::now();

        for i in 0..10 {
            sender.on_packet_sent(now, i * MSS, i, MSS, true);
        }
        ack_n(&mut sender, 0, 5, now);
        sender.on_packet_lost(9, MSS, 5 * MSS);
        assert!(sender.largest_sent_at_last_cutback().is_some());

        sender.on_connection_migration();
        assert_eq!(sender.get_congestion_window(), 10 * MSS);
        assert_eq!(
            sender.slowstart_threshold(),
            sender.max_congestion_window()
        );
        assert!(!sender.in_recovery());
        assert!(sender.in_slow_start());
        assert_eq!(sender.largest_sent_at_last_cutback(), None);
    }

    #[test]
    fn bandwidth_estimate_needs_rtt_sample() {
        let mut sender = new_sender(CongestionControlAlgorithm::Cubic);
        assert!(sender.bandwidth_estimate().is_infinite());

        let now = Instant::now();
        sender.update_rtt(Duration::from_millis(100), Duration::ZERO, now);
        assert_eq!(
            sender.bandwidth_estimate(),
            Bandwidth::from_delta(sender.get_congestion_window(), Duration::from_millis(100))
        );
    }

    #[test]
    fn hystart_exit_raises_threshold() {
        let mut sender = new_sender(CongestionControlAlgorithm::Cubic);
        let now = Instant::now();

        // Grow past the 16-packet gate.
        for i in 0..10 {
            sender.on_packet_sent(now, i * MSS, i, MSS, true);
        }
        ack_n(&mut sender, 0, 10, now);
        assert!(sender.get_congestion_window() >= 16 * MSS);

        // Establish a session minimum, then inflate the delay.
        sender.update_rtt(Duration::from_millis(100), Duration::ZERO, now);
        sender.on_packet_sent(now, 0, 100, MSS, true);
        for _ in 0..8 {
            sender.update_rtt(Duration::from_millis(130), Duration::ZERO, now);
            sender.maybe_exit_slow_start();
        }
        assert!(!sender.in_slow_start());
        assert_eq!(
            sender.slowstart_threshold(),
            sender.get_congestion_window()
        );
    }

    #[test]
    fn can_send_respects_window() {
        let sender = new_sender(CongestionControlAlgorithm::Cubic);
        let cwnd = sender.get_congestion_window();
        assert!(sender.can_send(0));
        assert!(sender.can_send(cwnd - 1));
        assert!(!sender.can_send(cwnd));
        assert!(!sender.can_send(cwnd + 1));
    }

    #[test]
    fn max_datagram_size_never_shrinks() {
        let mut sender = new_sender(CongestionControlAlgorithm::Cubic);
        sender.set_max_datagram_size(600);
        assert_eq!(sender.max_datagram_size(), MSS);

        sender.set_max_datagram_size(1500);
        assert_eq!(sender.max_datagram_size(), 1500);
        assert_eq!(sender.min_congestion_window(), 2 * 1500);
    }

    #[test]
    fn stale_ack_numbers_are_absorbed() {
        let mut sender = new_sender(CongestionControlAlgorithm::Cubic);
        let now = Instant::now();

        for i in 0..10 {
            sender.on_packet_sent(now, i * MSS, i, MSS, true);
        }
        ack_n(&mut sender, 5, 3, now);
        // An ack below the largest acked keeps the marker monotonic.
        sender.on_packet_acked(2, MSS, sender.get_congestion_window(), now);
        sender.on_packet_lost(9, MSS, 2 * MSS);
        assert!(sender.in_recovery());
    }
}
