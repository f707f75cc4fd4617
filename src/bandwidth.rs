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

//! Bandwidth arithmetic shared by the congestion controller and the pacer.

use std::fmt;
use std::time::Duration;

/// Bandwidth of a connection in bits per second.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Bandwidth(u64);

impl Bandwidth {
    /// Saturating sentinel used when no meaningful estimate exists, e.g.
    /// before the first RTT sample or for a zero-length interval.
    pub const INFINITE: Bandwidth = Bandwidth(u64::MAX);

    /// A zero bandwidth.
    pub const ZERO: Bandwidth = Bandwidth(0);

    /// Bandwidth of `bits` bits per second.
    pub const fn from_bits_per_second(bits: u64) -> Self {
        Bandwidth(bits)
    }

    /// Bandwidth of `bytes` bytes per second.
    pub const fn from_bytes_per_second(bytes: u64) -> Self {
        Bandwidth(bytes.saturating_mul(8))
    }

    /// Bandwidth resulting from transferring `bytes` within `delta`.
    ///
    /// The multiplication runs before the division in 128 bit so that
    /// sub-second deltas do not truncate the result to zero.
    pub fn from_delta(bytes: u64, delta: Duration) -> Self {
        if delta.is_zero() {
            return Bandwidth::INFINITE;
        }
        let bits = (bytes as u128)
            .saturating_mul(8)
            .saturating_mul(1_000_000_000)
            / delta.as_nanos();
        Bandwidth(bits.min(u64::MAX as u128) as u64)
    }

    /// The raw value in bits per second.
    pub const fn to_bits_per_second(self) -> u64 {
        self.0
    }

    /// Bytes deliverable at this rate over `duration`.
    ///
    /// This is the inverse of [`Bandwidth::from_delta`]; the fixed-rate
    /// override uses it to turn a target rate and a smoothed RTT back into a
    /// congestion window.
    pub fn bytes_for(self, duration: Duration) -> u64 {
        if self.is_infinite() {
            return u64::MAX;
        }
        let bytes = (self.0 as u128).saturating_mul(duration.as_nanos()) / 8 / 1_000_000_000;
        bytes.min(u64::MAX as u128) as u64
    }

    /// Whether this is the saturating "infinite" sentinel.
    pub const fn is_infinite(self) -> bool {
        self.0 == u64::MAX
    }

    /// Whether this bandwidth is zero.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Saturating multiplication by a `numerator / denominator` factor, used
    /// by the sender to derive its pacing rate.
    pub fn mul_div(self, numerator: u64, denominator: u64) -> Self {
        if self.is_infinite() || denominator == 0 {
            return self;
        }
        let bits = (self.0 as u128).saturating_mul(numerator as u128) / denominator as u128;
        Bandwidth(bits.min(u64::MAX as u128) as u64)
    }
}

impl fmt::Display for Bandwidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            return write!(f, "inf");
        }
        match self.0 {
            b if b >= 1_000_000_000 => write!(f, "{:.2} Gbps", b as f64 / 1e9),
            b if b >= 1_000_000 => write!(f, "{:.2} Mbps", b as f64 / 1e6),
            b if b >= 1_000 => write!(f, "{:.2} Kbps", b as f64 / 1e3),
            b => write!(f, "{} bps", b),
        }
    }
}
