//! Adaptive resend window and RTT estimation.
//!
//! Two window policies, chosen by how many packets are still unacknowledged:
//!
//! - **Casual** (fewer than [`INTENSE_THRESHOLD`] outstanding): ±[`CASUAL_STEP`]
//!   per cycle, clamped to [`CASUAL_MIN`]..=[`CASUAL_MAX`].
//! - **Intense**: ×1.5 on a clean cycle, ÷4 on loss, floored at
//!   [`INTENSE_MIN`] and capped at [`MAX_WINDOW`]. Only applied while the
//!   window does not already exceed the outstanding count.

use std::time::{Duration, Instant};

pub const INITIAL_WINDOW: usize = 10;
pub const CASUAL_MIN: usize = 10;
pub const CASUAL_MAX: usize = 50;
pub const CASUAL_STEP: usize = 5;
pub const INTENSE_THRESHOLD: usize = 100;
pub const INTENSE_MIN: usize = 50;
pub const MAX_WINDOW: usize = 4096;

/// Consecutive out-of-order notices that count as a loss event.
const OUT_OF_ORDER_LOSS: u32 = 3;
/// Consecutive cycles without an acknowledgement that count as a loss event.
const MISSED_CYCLES_LOSS: u32 = 2;

const MIN_RESEND_DELAY: Duration = Duration::from_millis(5);
const MAX_RESEND_DELAY: Duration = Duration::from_secs(1);

/// Default delay between resend cycles before an RTT sample exists.
pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_millis(20);

/// Window mode selected for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    Casual,
    Intense,
}

/// Congestion state for one session.
#[derive(Debug, Clone)]
pub struct CongestionController {
    window: usize,
    rtt: Option<Duration>,
    out_of_orders: u32,
    sent_this_cycle: u32,
    acks_this_cycle: u32,
    missed_cycles: u32,
    pending_send: Option<Instant>,
    resend_interval: Duration,
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new(DEFAULT_RESEND_INTERVAL)
    }
}

impl CongestionController {
    /// Create a controller that waits `resend_interval` between cycles until
    /// the first RTT sample arrives.
    pub fn new(resend_interval: Duration) -> Self {
        Self {
            window: INITIAL_WINDOW,
            rtt: None,
            out_of_orders: 0,
            sent_this_cycle: 0,
            acks_this_cycle: 0,
            missed_cycles: 0,
            pending_send: None,
            resend_interval,
        }
    }

    /// Current window size.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Smoothed round-trip time, once sampled.
    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    /// Record one packet transmission.
    pub fn on_send(&mut self, now: Instant) {
        if self.pending_send.is_none() {
            self.pending_send = Some(now);
        }
        self.sent_this_cycle += 1;
    }

    /// Record a cumulative acknowledgement.
    pub fn on_acknowledge(&mut self, now: Instant) {
        self.sample_rtt(now);
        self.out_of_orders = 0;
        self.acks_this_cycle += 1;
    }

    /// Record an out-of-order notice from the peer.
    pub fn on_out_of_order(&mut self, now: Instant) {
        self.sample_rtt(now);
        self.out_of_orders += 1;
    }

    /// Close the previous cycle, resize the window, and return the number of
    /// packets to send this cycle.
    pub fn begin_cycle(&mut self, outstanding: usize) -> usize {
        if self.acks_this_cycle == 0 && self.sent_this_cycle > 0 {
            self.missed_cycles += 1;
        } else {
            self.missed_cycles = 0;
        }
        self.sent_this_cycle = 0;
        self.acks_this_cycle = 0;

        let loss = self.loss_detected(outstanding);
        match Self::mode(outstanding) {
            WindowMode::Casual => {
                let next = if loss {
                    self.window.saturating_sub(CASUAL_STEP)
                } else {
                    self.window + CASUAL_STEP
                };
                self.window = next.clamp(CASUAL_MIN, CASUAL_MAX);
            }
            WindowMode::Intense => {
                if self.window <= outstanding {
                    let next = if loss {
                        self.window / 4
                    } else {
                        self.window + self.window / 2
                    };
                    self.window = next.clamp(INTENSE_MIN, MAX_WINDOW);
                }
            }
        }
        if loss {
            self.out_of_orders = 0;
            self.missed_cycles = 0;
        }
        self.window
    }

    /// Delay until the next resend cycle.
    pub fn resend_delay(&self) -> Duration {
        match self.rtt {
            Some(rtt) => rtt.clamp(MIN_RESEND_DELAY, MAX_RESEND_DELAY),
            None => self.resend_interval,
        }
    }

    /// Policy applied at the given outstanding count.
    pub fn mode(outstanding: usize) -> WindowMode {
        if outstanding < INTENSE_THRESHOLD {
            WindowMode::Casual
        } else {
            WindowMode::Intense
        }
    }

    fn loss_detected(&self, outstanding: usize) -> bool {
        outstanding > 0
            && ((self.missed_cycles >= MISSED_CYCLES_LOSS && self.rtt.is_some())
                || self.out_of_orders >= OUT_OF_ORDER_LOSS)
    }

    fn sample_rtt(&mut self, now: Instant) {
        let Some(sent) = self.pending_send.take() else {
            return;
        };
        let sample = now.saturating_duration_since(sent);
        self.rtt = Some(match self.rtt {
            Some(old) => old.mul_f64(0.875) + sample.mul_f64(0.125),
            None => sample,
        });
    }
}
