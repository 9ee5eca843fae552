//! The "OS networking layer" hook a [`crate::port::Port`] reports decoded
//! frames and bus-state transitions to, standing in for what the original
//! line discipline delivers through `netif_rx`/`can_bus_off` (§1).

use crate::can_err::ErrorFrame;
use crate::channel::BusState;
use crate::frame::Frame;

/// Receives decoded frames, bus-state transitions, and synthesized error
/// frames from a port.
///
/// All methods default to no-ops so a caller only interested in sending
/// frames (and reading counters/state by polling) can use [`NullSink`]
/// without writing an implementation.
pub trait NetSink: Send + Sync {
    /// A frame was successfully decoded off the wire for `channel`.
    fn on_frame(&self, channel: u8, frame: Frame) {
        let _ = (channel, frame);
    }

    /// `channel` transitioned to a new bus state, carrying the tx/rx error
    /// counters reported alongside the transition.
    fn on_state_change(&self, channel: u8, state: BusState, tx_errors: u32, rx_errors: u32) {
        let _ = (channel, state, tx_errors, rx_errors);
    }

    /// `channel` entered [`BusState::BusOff`]. Fired exactly once per
    /// bus-off entry, never on repeated bus-off state records.
    fn on_bus_off(&self, channel: u8) {
        let _ = channel;
    }

    /// A legacy `e`, structured `E`, or bus-state `s` record on `channel`
    /// was decoded into a synthesized [`ErrorFrame`] (§4.5). Delivered in
    /// addition to, not instead of, `on_state_change`/`on_bus_off` for
    /// records that also carry a state transition.
    fn on_error_frame(&self, channel: u8, frame: ErrorFrame) {
        let _ = (channel, frame);
    }
}

/// A [`NetSink`] that discards everything, for callers with no interest in
/// push notifications.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl NetSink for NullSink {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_sink_accepts_all_calls() {
        let sink = NullSink;
        sink.on_state_change(0, BusState::BusOff, 1, 2);
        sink.on_bus_off(0);
        sink.on_error_frame(0, ErrorFrame::default());
    }
}
