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

//! External steering of the congestion controller.
//!
//! A coordinator process stages adjustments through a [`ControlHandle`] from
//! its own thread; the packet-processing path consumes them at well-defined
//! points of the window computation. The two sides share only the staging
//! area, so neither ever blocks on the other beyond a short mutex hold.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use log::*;
use parking_lot::Mutex;

use super::CongestionControlModifier;
use super::CongestionStats;
use super::CubicAlgorithm;
use super::CubicCurve;
use super::CubicSender;
use super::SendAlgorithm;
use super::SignalObserver;
use super::WindowAdjustment;
use crate::Bandwidth;
use crate::SenderConfig;

/// Adjustments staged by the coordinator and not yet consumed.
#[derive(Debug, Default)]
struct StagedAdjustments {
    /// Replacement backoff factor, applied to the curve at the next loss
    /// cutback and sticky from then on.
    beta: Option<f64>,

    /// Window delta and conservative-allocation flag, consumed at the next
    /// window recomputation.
    window: Option<WindowAdjustment>,

    /// Signed delta folded into the recorded pre-loss maximum at the next
    /// loss cutback.
    last_max_delta: Option<i64>,
}

/// The staging area shared between the coordinator-facing handle and the
/// packet-processing path.
#[derive(Debug, Default)]
struct ControlStaging {
    staged: Mutex<StagedAdjustments>,

    /// Fixed-rate override in bits per second. Zero means no override.
    fixed_rate: AtomicU64,
}

impl ControlStaging {
    /// Stage a full adjustment set, overwriting anything not yet consumed.
    fn stage(
        &self,
        beta: f64,
        cwnd_adjust: i64,
        cwnd_max_adjust: i64,
        use_conservative_allocation: bool,
    ) {
        let mut staged = self.staged.lock();
        staged.beta = Some(beta);
        staged.window = Some(WindowAdjustment {
            cwnd_delta: cwnd_adjust,
            conservative_allocation: use_conservative_allocation,
        });
        staged.last_max_delta = Some(cwnd_max_adjust);
    }

    fn take_window_adjustment(&self) -> Option<WindowAdjustment> {
        self.staged.lock().window.take()
    }

    fn take_loss_adjustments(&self) -> (Option<f64>, Option<i64>) {
        let mut staged = self.staged.lock();
        (staged.beta.take(), staged.last_max_delta.take())
    }

    fn fixed_rate(&self) -> Option<Bandwidth> {
        let bits = self.fixed_rate.load(Ordering::Relaxed);
        if bits == 0 {
            None
        } else {
            Some(Bandwidth::from_bits_per_second(bits))
        }
    }
}

/// The cubic window function with staged coordinator adjustments folded into
/// the loss-path math. The sender drives it exactly like the plain curve.
struct ControlledCubic {
    inner: CubicCurve,
    staging: Arc<ControlStaging>,
}

impl CubicAlgorithm for ControlledCubic {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn on_application_limited(&mut self) {
        self.inner.on_application_limited();
    }

    fn congestion_window_after_packet_loss(&mut self, current_congestion_window: u64) -> u64 {
        let (beta, last_max_delta) = self.staging.take_loss_adjustments();
        if let Some(beta) = beta {
            self.inner.set_backoff_factor(beta as f32);
        }
        let new_window = self
            .inner
            .congestion_window_after_packet_loss(current_congestion_window);
        if let Some(delta) = last_max_delta {
            self.inner.adjust_last_max_congestion_window(delta);
        }
        new_window
    }

    fn congestion_window_after_ack(
        &mut self,
        acked_bytes: u64,
        current_congestion_window: u64,
        delay_min: Duration,
        event_time: Instant,
    ) -> u64 {
        self.inner.congestion_window_after_ack(
            acked_bytes,
            current_congestion_window,
            delay_min,
            event_time,
        )
    }

    fn set_num_connections(&mut self, n: usize) {
        self.inner.set_num_connections(n);
    }

    fn set_max_datagram_size(&mut self, max_datagram_size: u64) {
        self.inner.set_max_datagram_size(max_datagram_size);
    }

    fn take_window_adjustment(&mut self) -> Option<WindowAdjustment> {
        self.staging.take_window_adjustment()
    }
}

/// Coordinator-facing side of the staging area. Cloneable and safe to use
/// from any thread.
#[derive(Clone)]
pub struct ControlHandle {
    staging: Arc<ControlStaging>,
}

impl CongestionControlModifier for ControlHandle {
    fn apply_control(
        &self,
        beta: f64,
        cwnd_adjust: i64,
        cwnd_max_adjust: i64,
        use_conservative_allocation: bool,
    ) -> bool {
        debug!(
            "control staged: beta={} cwnd_adjust={} cwnd_max_adjust={} conservative={}",
            beta, cwnd_adjust, cwnd_max_adjust, use_conservative_allocation
        );
        self.staging
            .stage(beta, cwnd_adjust, cwnd_max_adjust, use_conservative_allocation);
        true
    }

    fn set_fixed_rate(&self, rate: Bandwidth) {
        debug!("control set fixed rate {}", rate);
        self.staging
            .fixed_rate
            .store(rate.to_bits_per_second(), Ordering::Relaxed);
    }
}

/// A [`CubicSender`] extended with coordinator steering and outbound
/// telemetry.
///
/// Inbound adjustments flow through the shared staging area and surface in
/// the window math at the next recomputation. Outbound events go to the
/// given observer synchronously on the packet-processing path; wrap it in a
/// [`super::SignalQueue`] when delivery may be slow.
pub struct ControlledCubicSender {
    inner: CubicSender,
    staging: Arc<ControlStaging>,
    observer: Box<dyn SignalObserver>,
}

impl ControlledCubicSender {
    pub fn new(conf: &SenderConfig, observer: Box<dyn SignalObserver>) -> Self {
        let staging = Arc::new(ControlStaging::default());
        let cubic = Box::new(ControlledCubic {
            inner: CubicCurve::new(conf.max_datagram_size, conf.num_emulated_connections),
            staging: staging.clone(),
        });
        Self {
            inner: CubicSender::with_cubic(conf, cubic),
            staging,
            observer,
        }
    }

    /// A cloneable handle for the coordinator side.
    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle {
            staging: self.staging.clone(),
        }
    }

    fn fixed_rate(&self) -> Option<Bandwidth> {
        self.staging.fixed_rate()
    }
}

impl SendAlgorithm for ControlledCubicSender {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn time_until_send(&self, bytes_in_flight: u64) -> Option<Instant> {
        self.inner.time_until_send(bytes_in_flight)
    }

    fn has_pacing_budget(&self, now: Instant) -> bool {
        self.inner.has_pacing_budget(now)
    }

    fn on_packet_sent(
        &mut self,
        now: Instant,
        bytes_in_flight: u64,
        packet_number: u64,
        bytes: u64,
        is_retransmittable: bool,
    ) {
        self.inner
            .on_packet_sent(now, bytes_in_flight, packet_number, bytes, is_retransmittable);
    }

    fn can_send(&self, bytes_in_flight: u64) -> bool {
        bytes_in_flight < self.get_congestion_window()
    }

    fn update_rtt(&mut self, latest_rtt: Duration, ack_delay: Duration, now: Instant) {
        self.inner.update_rtt(latest_rtt, ack_delay, now);
        self.observer
            .on_rtt_sample(now, self.inner.rtt().smoothed_rtt());
    }

    fn maybe_exit_slow_start(&mut self) {
        self.inner.maybe_exit_slow_start();
    }

    fn on_packet_acked(
        &mut self,
        packet_number: u64,
        acked_bytes: u64,
        prior_in_flight: u64,
        event_time: Instant,
    ) {
        self.inner
            .on_packet_acked(packet_number, acked_bytes, prior_in_flight, event_time);

        let packets_in_flight = prior_in_flight / self.inner.max_datagram_size().max(1);
        self.observer.on_ack(
            event_time,
            self.get_congestion_window(),
            packets_in_flight,
            acked_bytes,
        );
    }

    fn on_packet_lost(&mut self, packet_number: u64, lost_bytes: u64, prior_in_flight: u64) {
        // A stale loss for an already-handled episode takes no cutback and
        // must not be reported as one.
        let stale = self
            .inner
            .largest_sent_at_last_cutback()
            .map_or(false, |cutback| packet_number <= cutback);

        self.inner
            .on_packet_lost(packet_number, lost_bytes, prior_in_flight);

        if !stale {
            let now = Instant::now();
            self.observer.on_loss(now, self.inner.slowstart_threshold());
            self.observer
                .on_loss_ratio(now, self.inner.stats().loss_ratio());
        }
    }

    fn on_retransmission_timeout(&mut self, packets_retransmitted: bool) {
        self.inner.on_retransmission_timeout(packets_retransmitted);
        if packets_retransmitted {
            self.observer
                .on_loss(Instant::now(), self.inner.slowstart_threshold());
        }
    }

    fn on_connection_migration(&mut self) {
        self.inner.on_connection_migration();
        // The reset is a discontinuity the coordinator must see.
        self.observer
            .on_loss(Instant::now(), self.inner.slowstart_threshold());
    }

    fn set_max_datagram_size(&mut self, max_datagram_size: u64) {
        self.inner.set_max_datagram_size(max_datagram_size);
    }

    fn in_slow_start(&self) -> bool {
        self.inner.in_slow_start()
    }

    fn in_recovery(&self) -> bool {
        self.inner.in_recovery()
    }

    /// The loss-driven window, unless a fixed rate override is active; then
    /// the window that rate sustains over the measured smoothed RTT. Until
    /// the first RTT sample arrives the override has nothing to scale by and
    /// the loss-driven window stands.
    fn get_congestion_window(&self) -> u64 {
        match self.fixed_rate() {
            Some(rate) if self.inner.rtt().has_sample() => {
                rate.bytes_for(self.inner.rtt().smoothed_rtt())
            }
            _ => self.inner.get_congestion_window(),
        }
    }

    fn bandwidth_estimate(&self) -> Bandwidth {
        match self.fixed_rate() {
            Some(rate) => rate,
            None => self.inner.bandwidth_estimate(),
        }
    }

    fn stats(&self) -> &CongestionStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MSS: u64 = 1200;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Event {
        Rtt(Duration),
        Loss(u64),
        LossRatio(f64),
        Ack(u64, u64, u64),
    }

    #[derive(Default)]
    struct Recorder {
        events: Arc<Mutex<Vec<Event>>>,
    }

    impl SignalObserver for Recorder {
        fn on_rtt_sample(&self, _now: Instant, smoothed_rtt: Duration) {
            self.events.lock().push(Event::Rtt(smoothed_rtt));
        }

        fn on_loss(&self, _now: Instant, new_ssthresh: u64) {
            self.events.lock().push(Event::Loss(new_ssthresh));
        }

        fn on_loss_ratio(&self, _now: Instant, loss_ratio: f64) {
            self.events.lock().push(Event::LossRatio(loss_ratio));
        }

        fn on_ack(
            &self,
            _now: Instant,
            congestion_window: u64,
            packets_in_flight: u64,
            acked_bytes: u64,
        ) {
            self.events
                .lock()
                .push(Event::Ack(congestion_window, packets_in_flight, acked_bytes));
        }
    }

    struct Nop;
    impl SignalObserver for Nop {}

    fn new_controlled() -> (ControlledCubicSender, Arc<Mutex<Vec<Event>>>) {
        let recorder = Recorder::default();
        let events = recorder.events.clone();
        let conf = SenderConfig::default();
        (ControlledCubicSender::new(&conf, Box::new(recorder)), events)
    }

    #[test]
    fn window_delta_applies_on_next_ack() {
        let conf = SenderConfig::default();
        let mut sender = ControlledCubicSender::new(&conf, Box::new(Nop));
        let handle = sender.control_handle();
        let now = Instant::now();

        assert!(handle.apply_control(0.7, 5000, 0, false));

        let cwnd = sender.get_congestion_window();
        sender.on_packet_sent(now, cwnd, 1, MSS, true);
        sender.on_packet_acked(1, MSS, cwnd, now);

        // Slow start grew one datagram, then the staged delta landed.
        assert_eq!(sender.get_congestion_window(), cwnd + MSS + 5000);

        // Consumed exactly once: the next ack grows normally.
        let cwnd = sender.get_congestion_window();
        sender.on_packet_sent(now, cwnd, 2, MSS, true);
        sender.on_packet_acked(2, MSS, cwnd, now);
        assert_eq!(sender.get_congestion_window(), cwnd + MSS);
    }

    #[test]
    fn restaging_overwrites_unconsumed_delta() {
        let conf = SenderConfig::default();
        let mut sender = ControlledCubicSender::new(&conf, Box::new(Nop));
        let handle = sender.control_handle();
        let now = Instant::now();

        handle.apply_control(0.7, 50_000, 0, false);
        handle.apply_control(0.7, 2400, 0, false);

        let cwnd = sender.get_congestion_window();
        sender.on_packet_sent(now, cwnd, 1, MSS, true);
        sender.on_packet_acked(1, MSS, cwnd, now);
        assert_eq!(sender.get_congestion_window(), cwnd + MSS + 2400);
    }

    #[test]
    fn conservative_allocation_backs_off_once() {
        let conf = SenderConfig::default();
        let mut sender = ControlledCubicSender::new(&conf, Box::new(Nop));
        let handle = sender.control_handle();
        let now = Instant::now();

        handle.apply_control(0.7, 0, 0, true);

        let cwnd = sender.get_congestion_window();
        sender.on_packet_sent(now, cwnd, 1, MSS, true);
        sender.on_packet_acked(1, MSS, cwnd, now);

        // One slow start increment, then one multiplicative decrease with
        // the default two-connection beta of 0.85.
        assert_eq!(
            sender.get_congestion_window(),
            ((cwnd + MSS) as f32 * 0.85) as u64
        );
    }

    #[test]
    fn staged_beta_lands_on_loss_and_sticks() {
        let conf = SenderConfig::default();
        let mut sender = ControlledCubicSender::new(&conf, Box::new(Nop));
        let handle = sender.control_handle();
        let now = Instant::now();

        // beta = (2 - 1 + 0.5) / 2 = 0.75 once consumed at the cutback.
        handle.apply_control(0.5, 0, 0, false);

        let cwnd = sender.get_congestion_window();
        sender.on_packet_sent(now, 0, 1, MSS, true);
        sender.on_packet_lost(1, MSS, cwnd);
        assert_eq!(sender.get_congestion_window(), (cwnd as f32 * 0.75) as u64);

        // The override persists across later cutbacks without restaging.
        let cwnd = sender.get_congestion_window();
        sender.on_packet_sent(now, 0, 2, MSS, true);
        sender.on_packet_lost(2, MSS, cwnd);
        assert_eq!(sender.get_congestion_window(), (cwnd as f32 * 0.75) as u64);
    }

    #[test]
    fn last_max_delta_lands_on_loss() {
        let staging = Arc::new(ControlStaging::default());
        let mut cubic = ControlledCubic {
            inner: CubicCurve::new(MSS, 2),
            staging: staging.clone(),
        };

        staging.stage(0.7, 0, -20_000, false);
        cubic.congestion_window_after_packet_loss(100_000);
        assert_eq!(cubic.inner.last_max_congestion_window(), 80_000);

        // Consumed once.
        cubic.congestion_window_after_packet_loss(100_000);
        assert_eq!(cubic.inner.last_max_congestion_window(), 100_000);
    }

    #[test]
    fn fixed_rate_waits_for_first_rtt_sample() {
        let conf = SenderConfig::default();
        let mut sender = ControlledCubicSender::new(&conf, Box::new(Nop));
        let handle = sender.control_handle();

        // Before any RTT sample the override has nothing to scale by; the
        // loss-driven window stands rather than one derived from the
        // configured initial RTT.
        let loss_driven = sender.get_congestion_window();
        let rate = Bandwidth::from_bits_per_second(96_000_000);
        handle.set_fixed_rate(rate);
        assert_eq!(sender.get_congestion_window(), loss_driven);
        assert_eq!(sender.bandwidth_estimate(), rate);

        // The first sample switches the window over to the fixed rate.
        let now = Instant::now();
        sender.update_rtt(Duration::from_millis(100), Duration::ZERO, now);
        assert_eq!(sender.get_congestion_window(), 1_200_000);
    }

    #[test]
    fn fixed_rate_overrides_window_and_bandwidth() {
        let conf = SenderConfig::default();
        let mut sender = ControlledCubicSender::new(&conf, Box::new(Nop));
        let handle = sender.control_handle();
        let now = Instant::now();

        sender.update_rtt(Duration::from_millis(100), Duration::ZERO, now);
        let loss_driven = sender.get_congestion_window();

        let rate = Bandwidth::from_bits_per_second(96_000_000);
        handle.set_fixed_rate(rate);

        // 96 Mbps over a 100ms smoothed RTT sustains 1.2 MB in flight.
        assert_eq!(sender.get_congestion_window(), 1_200_000);
        assert_eq!(sender.bandwidth_estimate(), rate);
        assert!(sender.can_send(loss_driven));

        // Sticky: a loss cutback changes the inner window, not the override.
        sender.on_packet_sent(now, 0, 1, MSS, true);
        sender.on_packet_lost(1, MSS, MSS);
        assert_eq!(sender.get_congestion_window(), 1_200_000);
        assert_eq!(sender.bandwidth_estimate(), rate);
    }

    #[test]
    fn telemetry_events() {
        let _ = env_logger::builder().is_test(true).try_init();

        let (mut sender, events) = new_controlled();
        let now = Instant::now();

        sender.update_rtt(Duration::from_millis(80), Duration::ZERO, now);

        let cwnd = sender.get_congestion_window();
        for i in 0..3 {
            sender.on_packet_sent(now, cwnd, i, MSS, true);
        }
        sender.on_packet_acked(0, MSS, cwnd, now);
        sender.on_packet_lost(2, MSS, 2 * MSS);
        // Stale loss from the same episode: no further loss events.
        sender.on_packet_lost(1, MSS, MSS);
        let ssthresh_after_loss = sender.inner.slowstart_threshold();

        // An RTO cutback reports the halved threshold, without a loss ratio.
        sender.on_retransmission_timeout(true);
        let ssthresh_after_rto = sender.inner.slowstart_threshold();

        // A migration reset is a discontinuity and reports one as well.
        sender.on_connection_migration();

        let events = events.lock();
        assert_eq!(events[0], Event::Rtt(Duration::from_millis(80)));
        assert_eq!(events[1], Event::Ack(cwnd + MSS, cwnd / MSS, MSS));
        assert_eq!(events[2], Event::Loss(ssthresh_after_loss));
        assert!(matches!(events[3], Event::LossRatio(r) if r > 0.0));
        assert_eq!(events[4], Event::Loss(ssthresh_after_rto));
        assert_eq!(events[5], Event::Loss(sender.inner.slowstart_threshold()));
        assert_eq!(events.len(), 6);
    }

    #[test]
    fn handles_are_cloneable_across_threads() {
        let conf = SenderConfig::default();
        let sender = ControlledCubicSender::new(&conf, Box::new(Nop));
        let handle = sender.control_handle();

        let worker = std::thread::spawn({
            let handle = handle.clone();
            move || handle.apply_control(0.8, 1000, 0, false)
        });
        assert!(worker.join().unwrap());
        assert!(sender.staging.staged.lock().window.is_some());
    }
}
