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

//! A budget-based pacer smoothing packet departures within one RTT.

use std::time::Duration;
use std::time::Instant;

use crate::Bandwidth;

/// The pacing granularity. A packet is scheduled no closer than this to the
/// previous departure once the budget runs out.
const MIN_PACING_DELAY: Duration = Duration::from_millis(1);

/// The upper bound of burst packet number. The budget never accumulates
/// beyond this many datagrams (or one pacing granularity at the current
/// rate, whichever is larger).
const MAX_BURST_PACKETS: u64 = 10;

/// A token-bucket pacer.
///
/// The budget is debited on every send and replenished at the rate the
/// sender passes in, which it derives from its own bandwidth estimate. The
/// rate flows in as a parameter on each call so the pacer needs no back
/// reference to the sender.
#[derive(Debug)]
pub struct Pacer {
    /// Enable pacing or not. When disabled the budget is always available.
    enabled: bool,

    /// Max datagram size in bytes.
    max_datagram_size: u64,

    /// Remaining budget in bytes at the time of the last sent packet.
    budget_at_last_sent: u64,

    /// Departure time of the last sent packet. `None` until the first send;
    /// a fresh pacer grants a full burst.
    last_sent_time: Option<Instant>,
}

impl Pacer {
    pub fn new(enabled: bool, initial_congestion_window: u64, max_datagram_size: u64) -> Self {
        Self {
            enabled,
            max_datagram_size,
            budget_at_last_sent: initial_congestion_window,
            last_sent_time: None,
        }
    }

    /// Bytes that may depart at `now` without additional delay.
    pub fn budget(&self, now: Instant, rate: Bandwidth) -> u64 {
        if !self.enabled {
            return u64::MAX;
        }
        let last_sent = match self.last_sent_time {
            Some(t) => t,
            None => return self.max_burst_size(rate),
        };
        let elapsed = now.saturating_duration_since(last_sent);
        self.budget_at_last_sent
            .saturating_add(rate.bytes_for(elapsed))
            .min(self.max_burst_size(rate))
    }

    /// Whether the budget at `now` covers at least one full-sized datagram.
    pub fn has_budget(&self, now: Instant, rate: Bandwidth) -> bool {
        self.budget(now, rate) >= self.max_datagram_size
    }

    /// Debit the budget after a packet of `bytes` departed at `now`.
    pub fn on_packet_sent(&mut self, now: Instant, bytes: u64, rate: Bandwidth) {
        if !self.enabled {
            return;
        }
        self.budget_at_last_sent = self.budget(now, rate).saturating_sub(bytes);
        self.last_sent_time = Some(now);
    }

    /// The earliest time a further packet may depart. `None` means the
    /// packet may be sent immediately.
    pub fn time_until_send(&self, rate: Bandwidth) -> Option<Instant> {
        if !self.enabled || self.budget_at_last_sent >= self.max_datagram_size {
            return None;
        }
        if rate.is_infinite() || rate.is_zero() {
            return None;
        }
        let last_sent = self.last_sent_time?;

        // Time to refill the budget up to one datagram, rounded up.
        let missing = self.max_datagram_size - self.budget_at_last_sent;
        let rate_bits = rate.to_bits_per_second();
        let nanos = ((missing as u128 * 8 * 1_000_000_000) + rate_bits as u128 - 1)
            / rate_bits as u128;
        let delay = Duration::from_nanos(nanos.min(u64::MAX as u128) as u64);

        Some(last_sent + delay.max(MIN_PACING_DELAY))
    }

    /// Update the maximum datagram size.
    pub fn set_max_datagram_size(&mut self, max_datagram_size: u64) {
        self.max_datagram_size = max_datagram_size;
    }

    /// The burst ceiling: one pacing granularity at the current rate, but
    /// never less than a fixed packet count.
    fn max_burst_size(&self, rate: Bandwidth) -> u64 {
        rate.bytes_for(MIN_PACING_DELAY)
            .max(MAX_BURST_PACKETS * self.max_datagram_size)
    }
}
