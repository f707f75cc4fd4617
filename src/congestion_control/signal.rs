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

//! Outbound telemetry: congestion events reported to an external observer.

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use crossbeam::channel;
use log::*;

/// Default capacity of the event queue between the packet-processing path
/// and the observer thread.
const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Receiver of congestion events.
///
/// All methods default to no-ops, so an implementation subscribes only to
/// the events it cares about. Callbacks carry plain values; none of them may
/// reach back into the controller.
pub trait SignalObserver: Send {
    /// A new RTT sample was folded into the smoothed estimate.
    fn on_rtt_sample(&self, _now: Instant, _smoothed_rtt: Duration) {}

    /// A loss cutback was taken; `new_ssthresh` is the window after the
    /// multiplicative decrease. Not reported for stale losses of an episode
    /// that was already handled.
    fn on_loss(&self, _now: Instant, _new_ssthresh: u64) {}

    /// The cumulative loss ratio after a loss cutback.
    fn on_loss_ratio(&self, _now: Instant, _loss_ratio: f64) {}

    /// An ack was processed. `packets_in_flight` counts full-sized datagrams
    /// outstanding before the ack.
    fn on_ack(&self, _now: Instant, _congestion_window: u64, _packets_in_flight: u64, _acked_bytes: u64) {}
}

/// A congestion event carried from the packet-processing path to the
/// observer thread.
#[derive(Debug, Clone, Copy)]
enum SignalEvent {
    RttSample {
        now: Instant,
        smoothed_rtt: Duration,
    },
    Loss {
        now: Instant,
        new_ssthresh: u64,
    },
    LossRatio {
        now: Instant,
        loss_ratio: f64,
    },
    Ack {
        now: Instant,
        congestion_window: u64,
        packets_in_flight: u64,
        acked_bytes: u64,
    },
}

/// Decouples event delivery from the packet-processing path.
///
/// Events are pushed onto a bounded channel and replayed to the wrapped
/// observer on a dedicated thread, so a slow observer never stalls packet
/// processing. When the queue is full, new events are dropped and counted.
///
/// The queue is itself a [`SignalObserver`] and slots in wherever a direct
/// observer would.
pub struct SignalQueue {
    tx: Option<channel::Sender<SignalEvent>>,
    dropped: Arc<AtomicU64>,
    worker: Option<thread::JoinHandle<()>>,
}

impl SignalQueue {
    pub fn new(observer: Box<dyn SignalObserver>) -> Self {
        Self::with_capacity(observer, DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(observer: Box<dyn SignalObserver>, capacity: usize) -> Self {
        let (tx, rx) = channel::bounded::<SignalEvent>(capacity.max(1));
        let worker = thread::Builder::new()
            .name("signal-queue".into())
            .spawn(move || {
                for event in rx.iter() {
                    match event {
                        SignalEvent::RttSample { now, smoothed_rtt } => {
                            observer.on_rtt_sample(now, smoothed_rtt)
                        }
                        SignalEvent::Loss { now, new_ssthresh } => {
                            observer.on_loss(now, new_ssthresh)
                        }
                        SignalEvent::LossRatio { now, loss_ratio } => {
                            observer.on_loss_ratio(now, loss_ratio)
                        }
                        SignalEvent::Ack {
                            now,
                            congestion_window,
                            packets_in_flight,
                            acked_bytes,
                        } => observer.on_ack(now, congestion_window, packets_in_flight, acked_bytes),
                    }
                }
            })
            .ok();
        if worker.is_none() {
            error!("signal queue worker thread could not be spawned, events will be dropped");
        }

        Self {
            tx: Some(tx),
            dropped: Arc::new(AtomicU64::new(0)),
            worker,
        }
    }

    /// Number of events dropped because the queue was full.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn push(&self, event: SignalEvent) {
        let tx = match &self.tx {
            Some(tx) => tx,
            None => return,
        };
        if tx.try_send(event).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            trace!("signal queue full, {} events dropped so far", dropped);
        }
    }
}

impl SignalObserver for SignalQueue {
    fn on_rtt_sample(&self, now: Instant, smoothed_rtt: Duration) {
        self.push(SignalEvent::RttSample { now, smoothed_rtt });
    }

    fn on_loss(&self, now: Instant, new_ssthresh: u64) {
        self.push(SignalEvent::Loss { now, new_ssthresh });
    }

    fn on_loss_ratio(&self, now: Instant, loss_ratio: f64) {
        self.push(SignalEvent::LossRatio { now, loss_ratio });
    }

    fn on_ack(
        &self,
        now: Instant,
        congestion_window: u64,
        packets_in_flight: u64,
        acked_bytes: u64,
    ) {
        self.push(SignalEvent::Ack {
            now,
            congestion_window,
            packets_in_flight,
            acked_bytes,
        });
    }
}

impl Drop for SignalQueue {
    fn drop(&mut self) {
        // Close the channel so the worker drains what is buffered and exits.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
