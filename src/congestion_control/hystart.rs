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

//! Hybrid slow start: exit exponential growth before a loss occurs.
//!
//! Slow start can overshoot the ideal send rate, causing high packet loss
//! and poor performance. The detector uses increase in round-trip delay as a
//! heuristic to find an exit point before possible overshoot: when the
//! minimum RTT observed over the first samples of a round exceeds the
//! session minimum by a threshold, the sender should leave slow start.

use std::time::Duration;

use log::*;

/// Tuning constants. Do not exit slow start below this window (in packets);
/// the delay signal is too noisy when only a handful of packets are in
/// flight per round.
const HYBRID_START_LOW_WINDOW: u64 = 16;

/// Tuning constants. Number of RTT samples examined per round. Only the
/// first few acks of a burst are compared against the session minimum.
const HYBRID_START_MIN_SAMPLES: u32 = 8;

/// Tuning constants. Exit threshold exponent: the delay-increase threshold
/// is min_rtt / 2^3.
const HYBRID_START_DELAY_FACTOR_EXP: u32 = 3;

/// Tuning constants. Lower bound of the delay increase threshold. Smaller
/// values cause spurious exits on jittery paths.
const HYBRID_START_DELAY_MIN_THRESHOLD_US: u64 = 4000;

/// Tuning constants. Upper bound of the delay increase threshold. Larger
/// values can keep large-RTT paths in slow start until loss.
const HYBRID_START_DELAY_MAX_THRESHOLD_US: u64 = 16000;

/// Delay-increase detector for exiting slow start early.
///
/// A round is the spacing between the packet that opens it and the ack that
/// covers the last packet sent when the round began.
#[derive(Debug)]
pub struct HybridSlowStart {
    /// Whether the detector is enabled. When disabled it never signals an
    /// exit and slow start runs until the threshold or a loss.
    enabled: bool,

    /// Whether a receive round is in progress.
    started: bool,

    /// Whether the delay increase was detected in the current or an earlier
    /// round.
    hystart_found: bool,

    /// The last packet number sent, marking the end of a future round.
    last_sent_packet_number: u64,

    /// The packet number that ends the current round.
    end_packet_number: u64,

    /// RTT samples examined so far in the current round.
    rtt_sample_count: u32,

    /// The minimum RTT observed over the current round's samples.
    current_min_rtt: Duration,
}

impl HybridSlowStart {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            started: false,
            hystart_found: false,
            last_sent_packet_number: 0,
            end_packet_number: 0,
            rtt_sample_count: 0,
            current_min_rtt: Duration::ZERO,
        }
    }

    /// Whether the detector is enabled.
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Track the highest sent packet number; it ends the round that starts
    /// next.
    pub fn on_packet_sent(&mut self, packet_number: u64) {
        self.last_sent_packet_number = packet_number;
    }

    /// Close the current round once the ack train passes its end marker.
    pub fn on_packet_acked(&mut self, acked_packet_number: u64) {
        if self.is_end_of_round(acked_packet_number) {
            self.started = false;
        }
    }

    /// Whether the observed delay increase says slow start should end.
    /// `congestion_window` is in packets.
    pub fn should_exit_slow_start(
        &mut self,
        latest_rtt: Duration,
        min_rtt: Duration,
        congestion_window: u64,
    ) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.started {
            self.start_receive_round(self.last_sent_packet_number);
        }
        if self.hystart_found {
            return congestion_window >= HYBRID_START_LOW_WINDOW;
        }

        // Compare the minimum delay of the first acks of this round against
        // the session minimum; per-round rather than per-packet RTT keeps
        // single delayed acks from triggering an exit.
        if self.rtt_sample_count < HYBRID_START_MIN_SAMPLES {
            self.rtt_sample_count += 1;
            if self.current_min_rtt.is_zero() || self.current_min_rtt > latest_rtt {
                self.current_min_rtt = latest_rtt;
            }
        }

        if self.rtt_sample_count == HYBRID_START_MIN_SAMPLES {
            let threshold_us = (min_rtt.as_micros() as u64 >> HYBRID_START_DELAY_FACTOR_EXP)
                .clamp(
                    HYBRID_START_DELAY_MIN_THRESHOLD_US,
                    HYBRID_START_DELAY_MAX_THRESHOLD_US,
                );
            let threshold = Duration::from_micros(threshold_us);

            if self.current_min_rtt > min_rtt.saturating_add(threshold) {
                debug!(
                    "hybrid slow start found delay increase: round min {:?} vs session min {:?}",
                    self.current_min_rtt, min_rtt
                );
                self.hystart_found = true;
            }
        }

        congestion_window >= HYBRID_START_LOW_WINDOW && self.hystart_found
    }

    /// Restart detection after a loss cutback or retransmission timeout.
    pub fn restart(&mut self) {
        self.started = false;
        self.hystart_found = false;
    }

    fn start_receive_round(&mut self, last_sent: u64) {
        self.end_packet_number = last_sent;
        self.current_min_rtt = Duration::ZERO;
        self.rtt_sample_count = 0;
        self.started = true;
    }

    fn is_end_of_round(&self, acked_packet_number: u64) -> bool {
        self.end_packet_number < acked_packet_number
    }
}
