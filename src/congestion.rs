//! Congestion control for the send scheduler.
//!
//! One concrete algorithm (Cubic window growth per RFC 8312, with a
//! resend-rate loss signal) plus a no-op control for unmanaged sends. The
//! scheduler consults `is_congested` before admitting genes to the wire and
//! advances every active instance once per send cycle via `process`.

use std::sync::Mutex;
use tracing::{debug, trace};

/// Admission gate + periodic update. Implementations are shared between a
/// connection and the terminal-wide active list, so all methods take `&self`.
pub trait CongestionControl: Send + Sync + 'static {
    /// Consulted by the send scheduler before each gene is admitted.
    fn is_congested(&self) -> bool;

    /// Periodic update; advances internal clocks by `elapsed_mics`.
    /// Returns `false` to request removal from the active list.
    fn process(&self, elapsed_mics: u64) -> bool;

    fn on_send(&self, genes: u32);
    fn on_ack(&self, genes: u32);
    fn on_resend(&self, genes: u32);
}

/// Always admits; used for unmanaged/control sends before a real algorithm
/// attaches to a connection.
pub struct NoCongestionControl;

impl CongestionControl for NoCongestionControl {
    fn is_congested(&self) -> bool {
        false
    }

    fn process(&self, _elapsed_mics: u64) -> bool {
        false
    }

    fn on_send(&self, _genes: u32) {}
    fn on_ack(&self, _genes: u32) {}
    fn on_resend(&self, _genes: u32) {}
}

const CUBIC_C: f64 = 0.4;
const CUBIC_BETA: f64 = 0.7;

const INITIAL_CWND: f64 = 32.0;
const MIN_CWND: f64 = 2.0;
const MAX_CWND: f64 = 100_000.0;

/// Resend/send ratio above which a loss event is declared.
const RESEND_RATE_THRESHOLD: f64 = 0.05;
/// The resend ratio is evaluated over windows of this length.
const EVAL_INTERVAL_MICS: u64 = 100_000;
/// Minimum sends in an evaluation window for the ratio to be meaningful.
const MIN_EVAL_SENDS: u32 = 8;

#[derive(Debug)]
struct CubicState {
    cwnd: f64,
    ssthresh: f64,
    /// cwnd at the last loss event
    w_max: f64,
    /// time (seconds) at which the cubic curve reaches w_max again
    k: f64,
    since_loss_mics: u64,
    in_flight: u32,
    sent_recent: u32,
    resent_recent: u32,
    eval_elapsed_mics: u64,
}

/// Cubic window growth on success, multiplicative decrease on a detected
/// resend-rate loss signal. Created lazily on a connection's first managed
/// send and registered into the terminal-wide active list.
pub struct CubicCongestionControl {
    state: Mutex<CubicState>,
}

impl Default for CubicCongestionControl {
    fn default() -> Self {
        Self::new()
    }
}

impl CubicCongestionControl {
    pub fn new() -> CubicCongestionControl {
        CubicCongestionControl {
            state: Mutex::new(CubicState {
                cwnd: INITIAL_CWND,
                ssthresh: MAX_CWND,
                w_max: INITIAL_CWND,
                k: 0.0,
                since_loss_mics: 0,
                in_flight: 0,
                sent_recent: 0,
                resent_recent: 0,
                eval_elapsed_mics: 0,
            }),
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.state.lock().unwrap().cwnd as u32
    }

    pub fn in_flight(&self) -> u32 {
        self.state.lock().unwrap().in_flight
    }

    #[cfg(test)]
    fn set_internals(&self, cwnd: f64, ssthresh: f64, in_flight: u32) {
        let mut state = self.state.lock().unwrap();
        state.cwnd = cwnd;
        state.ssthresh = ssthresh;
        state.in_flight = in_flight;
    }

    fn enter_loss(state: &mut CubicState) {
        state.w_max = state.cwnd;
        state.cwnd = (state.cwnd * CUBIC_BETA).max(MIN_CWND);
        state.ssthresh = state.cwnd;
        state.k = (state.w_max * (1.0 - CUBIC_BETA) / CUBIC_C).cbrt();
        state.since_loss_mics = 0;
        debug!("congestion signal: cwnd reduced to {:.1}", state.cwnd);
    }
}

impl CongestionControl for CubicCongestionControl {
    fn is_congested(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.in_flight as f64 >= state.cwnd
    }

    fn process(&self, elapsed_mics: u64) -> bool {
        let mut state = self.state.lock().unwrap();
        state.since_loss_mics += elapsed_mics;
        state.eval_elapsed_mics += elapsed_mics;

        if state.eval_elapsed_mics >= EVAL_INTERVAL_MICS {
            if state.sent_recent >= MIN_EVAL_SENDS {
                let ratio = state.resent_recent as f64 / state.sent_recent as f64;
                trace!("resend ratio over evaluation window: {:.3}", ratio);
                if ratio > RESEND_RATE_THRESHOLD {
                    Self::enter_loss(&mut state);
                }
            }
            state.sent_recent = 0;
            state.resent_recent = 0;
            state.eval_elapsed_mics = 0;
        }

        // cubic growth outside slow start
        if state.cwnd >= state.ssthresh {
            let t = state.since_loss_mics as f64 / 1_000_000.0;
            let target = CUBIC_C * (t - state.k).powi(3) + state.w_max;
            if target > state.cwnd {
                state.cwnd = target.clamp(MIN_CWND, MAX_CWND);
            }
        }

        state.in_flight > 0 || state.in_flight as f64 >= state.cwnd
    }

    fn on_send(&self, genes: u32) {
        let mut state = self.state.lock().unwrap();
        state.in_flight += genes;
        state.sent_recent += genes;
    }

    fn on_ack(&self, genes: u32) {
        let mut state = self.state.lock().unwrap();
        state.in_flight = state.in_flight.saturating_sub(genes);
        if state.cwnd < state.ssthresh {
            // slow start
            state.cwnd = (state.cwnd + genes as f64).min(MAX_CWND);
        }
    }

    fn on_resend(&self, genes: u32) {
        let mut state = self.state.lock().unwrap();
        state.sent_recent += genes;
        state.resent_recent += genes;
    }
}
