//! Congestion controller selection.
//!
//! The auth handshake decides between two senders: "Brutal", a
//! constant-rate sender pinned to a negotiated bits-per-second target, and
//! BBR for automatic mode. quinn fixes a connection's controller at
//! handshake time, so the deferred install is modeled with a controller
//! that is created in BBR mode on every connection and switches to Brutal
//! when the post-auth selection latches a rate into the shared
//! [`CongestionTuning`] cell. The latch fires at most once per connection.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;
use quinn_proto::congestion::{BbrConfig, Controller, ControllerFactory};
use quinn_proto::RttEstimator;

use crate::protocol::AuthResponse;

const MODE_DEFAULT: u8 = 0;
const MODE_BBR: u8 = 1;
const MODE_BRUTAL: u8 = 2;

/// Congestion window multiplier over `rate * srtt`, compensating for ack
/// aggregation the same way the reference Brutal sender does.
const BRUTAL_WINDOW_NUM: u64 = 3;
const BRUTAL_WINDOW_DEN: u64 = 2;

const BRUTAL_DEBUG_INTERVAL: Duration = Duration::from_secs(1);

/// The outcome of bandwidth negotiation for one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Constant-rate sender at the given bits per second.
    Brutal(u64),
    /// Leave rate control to BBR.
    Bbr,
}

/// Client policy: BBR when the server asked for auto mode or no usable
/// rate was negotiated, otherwise Brutal at the lower of the server's
/// advertised receive rate and the local send cap.
///
/// A server `rx` of 0 falls back to the local send cap even when `rx_auto`
/// is false; this collapses "no cap" and "auto" onto the client but is the
/// reference implementation's behavior, kept for compatibility.
pub fn negotiate_client_tx(response: &AuthResponse, send_bps: u64) -> Selection {
    let mut actual_tx = response.rx;
    if actual_tx == 0 || actual_tx > send_bps {
        actual_tx = send_bps;
    }
    if !response.rx_auto && actual_tx > 0 {
        Selection::Brutal(actual_tx)
    } else {
        Selection::Bbr
    }
}

/// Server policy: BBR when configured to ignore client bandwidth or when
/// the client advertised no receive rate, otherwise Brutal at the lower of
/// the client's rate and the local send cap.
pub fn negotiate_server_tx(
    request_rx: u64,
    send_bps: u64,
    ignore_client_bandwidth: bool,
) -> Selection {
    if ignore_client_bandwidth || request_rx == 0 {
        return Selection::Bbr;
    }
    let tx = if send_bps > 0 && send_bps < request_rx {
        send_bps
    } else {
        request_rx
    };
    Selection::Brutal(tx)
}

/// Per-connection tuning cell shared between the session logic and the
/// controller living inside the QUIC stack.
#[derive(Debug, Default)]
pub struct CongestionTuning {
    mode: AtomicU8,
    rate_bps: AtomicU64,
    installed: AtomicBool,
}

impl CongestionTuning {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Latches the negotiated selection. Returns false when a selection was
    /// already installed; the first install wins and later ones are no-ops.
    pub fn install(&self, selection: Selection) -> bool {
        if self
            .installed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        match selection {
            Selection::Brutal(rate_bps) => {
                self.rate_bps.store(rate_bps, Ordering::Release);
                self.mode.store(MODE_BRUTAL, Ordering::Release);
            }
            Selection::Bbr => {
                self.mode.store(MODE_BBR, Ordering::Release);
            }
        }
        true
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    pub fn selection(&self) -> Option<Selection> {
        match self.mode.load(Ordering::Acquire) {
            MODE_BRUTAL => Some(Selection::Brutal(self.rate_bps.load(Ordering::Acquire))),
            MODE_BBR => Some(Selection::Bbr),
            _ => None,
        }
    }

    fn brutal_rate(&self) -> Option<u64> {
        if self.mode.load(Ordering::Acquire) == MODE_BRUTAL {
            Some(self.rate_bps.load(Ordering::Acquire))
        } else {
            None
        }
    }
}

fn brutal_window(rate_bps: u64, srtt: Duration, current_mtu: u16, initial_window: u64) -> u64 {
    let floor = 4 * current_mtu as u64;
    if srtt.is_zero() {
        return initial_window.max(floor);
    }
    let bytes_per_sec = rate_bps / 8;
    let window = bytes_per_sec * srtt.as_micros() as u64 / 1_000_000;
    (window * BRUTAL_WINDOW_NUM / BRUTAL_WINDOW_DEN).max(floor)
}

/// A controller that runs BBR until the tuning cell pins a Brutal rate.
pub struct DynamicController {
    tuning: Arc<CongestionTuning>,
    bbr: Box<dyn Controller>,
    initial_window: u64,
    current_mtu: u16,
    srtt: Duration,
    brutal_debug: bool,
    last_debug: Option<Instant>,
}

impl fmt::Debug for DynamicController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicController")
            .field("tuning", &self.tuning)
            .field("srtt", &self.srtt)
            .finish_non_exhaustive()
    }
}

impl Controller for DynamicController {
    fn on_sent(&mut self, now: Instant, bytes: u64, last_packet_number: u64) {
        self.bbr.on_sent(now, bytes, last_packet_number);
    }

    fn on_ack(
        &mut self,
        now: Instant,
        sent: Instant,
        bytes: u64,
        app_limited: bool,
        rtt: &RttEstimator,
    ) {
        self.srtt = rtt.get();
        self.bbr.on_ack(now, sent, bytes, app_limited, rtt);
        if self.brutal_debug {
            if let Some(rate_bps) = self.tuning.brutal_rate() {
                let due = match self.last_debug {
                    Some(last) => now.duration_since(last) >= BRUTAL_DEBUG_INTERVAL,
                    None => true,
                };
                if due {
                    self.last_debug = Some(now);
                    debug!(
                        "brutal sender: rate={}bps srtt={:?} window={}",
                        rate_bps,
                        self.srtt,
                        self.window()
                    );
                }
            }
        }
    }

    fn on_end_acks(
        &mut self,
        now: Instant,
        in_flight: u64,
        app_limited: bool,
        largest_packet_num_acked: Option<u64>,
    ) {
        self.bbr
            .on_end_acks(now, in_flight, app_limited, largest_packet_num_acked);
    }

    fn on_congestion_event(
        &mut self,
        now: Instant,
        sent: Instant,
        is_persistent_congestion: bool,
        lost_bytes: u64,
    ) {
        // a constant-rate sender ignores loss signals
        if self.tuning.brutal_rate().is_some() {
            return;
        }
        self.bbr
            .on_congestion_event(now, sent, is_persistent_congestion, lost_bytes);
    }

    fn on_mtu_update(&mut self, new_mtu: u16) {
        self.current_mtu = new_mtu;
        self.bbr.on_mtu_update(new_mtu);
    }

    fn window(&self) -> u64 {
        match self.tuning.brutal_rate() {
            Some(rate_bps) => {
                brutal_window(rate_bps, self.srtt, self.current_mtu, self.initial_window)
            }
            None => self.bbr.window(),
        }
    }

    fn clone_box(&self) -> Box<dyn Controller> {
        Box::new(Self {
            tuning: self.tuning.clone(),
            bbr: self.bbr.clone_box(),
            initial_window: self.initial_window,
            current_mtu: self.current_mtu,
            srtt: self.srtt,
            brutal_debug: self.brutal_debug,
            last_debug: self.last_debug,
        })
    }

    fn initial_window(&self) -> u64 {
        self.initial_window
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

pub struct DynamicControllerFactory {
    tuning: Arc<CongestionTuning>,
    bbr_config: Arc<BbrConfig>,
    brutal_debug: bool,
}

impl DynamicControllerFactory {
    /// `initial_window` of 0 keeps BBR's default.
    pub fn new(tuning: Arc<CongestionTuning>, initial_window: u64, brutal_debug: bool) -> Self {
        let mut bbr_config = BbrConfig::default();
        if initial_window > 0 {
            bbr_config.initial_window(initial_window);
        }
        Self {
            tuning,
            bbr_config: Arc::new(bbr_config),
            brutal_debug,
        }
    }
}

impl fmt::Debug for DynamicControllerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicControllerFactory")
            .field("tuning", &self.tuning)
            .finish_non_exhaustive()
    }
}

impl ControllerFactory for DynamicControllerFactory {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u16) -> Box<dyn Controller> {
        let bbr = self.bbr_config.clone().build(now, current_mtu);
        let initial_window = bbr.initial_window();
        Box::new(DynamicController {
            tuning: self.tuning.clone(),
            bbr,
            initial_window,
            current_mtu,
            srtt: Duration::ZERO,
            brutal_debug: self.brutal_debug,
            last_debug: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_policy_brutal_takes_minimum() {
        let response = AuthResponse {
            udp_enabled: true,
            rx: 50_000_000,
            rx_auto: false,
        };
        assert_eq!(
            negotiate_client_tx(&response, 100_000_000),
            Selection::Brutal(50_000_000)
        );
        assert_eq!(
            negotiate_client_tx(&response, 30_000_000),
            Selection::Brutal(30_000_000)
        );
    }

    #[test]
    fn test_client_policy_auto_mode_uses_bbr() {
        let response = AuthResponse {
            udp_enabled: true,
            rx: 0,
            rx_auto: true,
        };
        assert_eq!(negotiate_client_tx(&response, 100_000_000), Selection::Bbr);
    }

    #[test]
    fn test_client_policy_server_zero_rx_falls_back_to_send_bps() {
        let response = AuthResponse {
            udp_enabled: true,
            rx: 0,
            rx_auto: false,
        };
        assert_eq!(
            negotiate_client_tx(&response, 100_000_000),
            Selection::Brutal(100_000_000)
        );
        // no local cap either: nothing to pace at, use bbr
        assert_eq!(negotiate_client_tx(&response, 0), Selection::Bbr);
    }

    #[test]
    fn test_server_policy() {
        assert_eq!(
            negotiate_server_tx(50_000_000, 80_000_000, false),
            Selection::Brutal(50_000_000)
        );
        assert_eq!(
            negotiate_server_tx(50_000_000, 20_000_000, false),
            Selection::Brutal(20_000_000)
        );
        assert_eq!(
            negotiate_server_tx(50_000_000, 0, false),
            Selection::Brutal(50_000_000)
        );
        assert_eq!(negotiate_server_tx(50_000_000, 80_000_000, true), Selection::Bbr);
        assert_eq!(negotiate_server_tx(0, 80_000_000, false), Selection::Bbr);
    }

    #[test]
    fn test_tuning_installs_exactly_once() {
        let tuning = CongestionTuning::new();
        assert!(!tuning.is_installed());
        assert!(tuning.install(Selection::Brutal(1_000_000)));
        assert!(!tuning.install(Selection::Bbr));
        assert_eq!(tuning.selection(), Some(Selection::Brutal(1_000_000)));
    }

    #[test]
    fn test_brutal_window_scales_with_rate_and_rtt() {
        let mtu = 1200u16;
        // 100 Mbps at 100ms rtt: 1.25 MB in flight, times 3/2
        let window = brutal_window(100_000_000, Duration::from_millis(100), mtu, 0);
        assert_eq!(window, 1_250_000 * 3 / 2);
        // unknown rtt falls back to the initial window
        assert_eq!(
            brutal_window(100_000_000, Duration::ZERO, mtu, 65_536),
            65_536
        );
        // tiny rates are floored to a usable window
        assert_eq!(
            brutal_window(8, Duration::from_millis(100), mtu, 0),
            4 * mtu as u64
        );
    }
}
