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

//! Flowsteer is a pluggable, loss-based congestion control core for
//! packet-oriented transport connections.
//!
//! It combines a CUBIC/Reno window-growth algorithm (budget-based pacing,
//! hybrid slow start, NewReno-style recovery) with an external control-signal
//! interface: a coordinator outside the connection can observe per-flow
//! congestion telemetry and inject real-time adjustments to the controller's
//! window bounds.
//!
//! The transport layer drives a [`SendAlgorithm`] on its packet path
//! (sent/acked/lost/RTO/migration) and reads back the window through
//! [`SendAlgorithm::get_congestion_window`] and [`SendAlgorithm::can_send`].
//! A coordinator steers a [`ControlledCubicSender`] through a cloneable
//! [`ControlHandle`] and subscribes to telemetry with a [`SignalObserver`].

use std::time::Duration;

pub use crate::bandwidth::Bandwidth;
pub use crate::congestion_control::build_send_algorithm;
pub use crate::congestion_control::CongestionControlAlgorithm;
pub use crate::congestion_control::CongestionControlModifier;
pub use crate::congestion_control::CongestionStats;
pub use crate::congestion_control::ControlHandle;
pub use crate::congestion_control::ControlledCubicSender;
pub use crate::congestion_control::CubicSender;
pub use crate::congestion_control::SendAlgorithm;
pub use crate::congestion_control::SignalObserver;
pub use crate::congestion_control::SignalQueue;
pub use crate::error::Error;
pub use crate::rtt::RttEstimator;

/// A specialized [`Result`] type for controller operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Default outgoing udp datagram payload size in bytes.
pub const DEFAULT_SEND_UDP_PAYLOAD_SIZE: u64 = 1200;

/// When no previous RTT is available, the initial RTT SHOULD be set to
/// 333 milliseconds. See RFC 9002 Section 6.2.2
pub const INITIAL_RTT: Duration = Duration::from_millis(333);

/// The minimal congestion window in packets.
/// The RECOMMENDED value is 2 * max_datagram_size.
/// See RFC 9002 Section 7.2
const DEFAULT_MIN_CONGESTION_WINDOW_PACKETS: u64 = 2;

/// The initial congestion window in packets.
/// Endpoints SHOULD use an initial congestion window of ten times the
/// maximum datagram size. See RFC 9002 Section 7.2
const DEFAULT_INITIAL_CONGESTION_WINDOW_PACKETS: u64 = 10;

/// The default upper bound of the congestion window in packets.
const DEFAULT_MAX_CONGESTION_WINDOW_PACKETS: u64 = 10000;

/// The default number of TCP connections the cubic window function emulates
/// when competing for bandwidth on a shared bottleneck.
const DEFAULT_NUM_EMULATED_CONNECTIONS: usize = 2;

/// Configuration for a per-connection congestion controller.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// The congestion control algorithm used for the connection.
    pub congestion_control_algorithm: CongestionControlAlgorithm,

    /// The maximum size of outgoing UDP payloads in bytes.
    pub max_datagram_size: u64,

    /// The minimal congestion window in packets.
    pub min_congestion_window: u64,

    /// The initial congestion window in packets.
    pub initial_congestion_window: u64,

    /// The upper bound of the congestion window in packets. The initial
    /// slow start threshold is set to this window.
    pub max_congestion_window: u64,

    /// The initial rtt, used before a real rtt is estimated.
    pub initial_rtt: Duration,

    /// Enable hybrid slow start, exiting exponential growth on RTT
    /// inflation before a loss occurs.
    pub enable_hystart: bool,

    /// Enable pacing to smooth the flow of packets sent onto the network.
    pub enable_pacing: bool,

    /// The number of TCP connections the cubic backoff emulates.
    pub num_emulated_connections: usize,
}

impl Default for SenderConfig {
    fn default() -> SenderConfig {
        SenderConfig {
            congestion_control_algorithm: CongestionControlAlgorithm::Cubic,
            max_datagram_size: DEFAULT_SEND_UDP_PAYLOAD_SIZE,
            min_congestion_window: DEFAULT_MIN_CONGESTION_WINDOW_PACKETS,
            initial_congestion_window: DEFAULT_INITIAL_CONGESTION_WINDOW_PACKETS,
            max_congestion_window: DEFAULT_MAX_CONGESTION_WINDOW_PACKETS,
            initial_rtt: INITIAL_RTT,
            enable_hystart: true,
            enable_pacing: true,
            num_emulated_connections: DEFAULT_NUM_EMULATED_CONNECTIONS,
        }
    }
}

#[path = "congestion_control/congestion_control.rs"]
pub mod congestion_control;

mod bandwidth;
pub mod error;
mod rtt;
