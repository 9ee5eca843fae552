//! Receive de-escape state machine, channel selection, and record dispatch
//! (§4.2, §4.5).

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::can_err;
use crate::channel::{BusState, ChannelRecord};
use crate::frame;
use crate::port::{Port, PortInner, SLCAN_MTU};

/// A bounded line-accumulation buffer plus the "drop until next terminator"
/// latch the original calls `SLF_ERROR`/`INBOUND_ERROR`.
pub(crate) struct LineBuffer {
    pub(crate) buf: Vec<u8>,
    pub(crate) inbound_error: bool,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        LineBuffer {
            buf: Vec::with_capacity(SLCAN_MTU),
            inbound_error: false,
        }
    }
}

fn first_existing(slots: &[Option<Arc<ChannelRecord>>; 4]) -> Option<Arc<ChannelRecord>> {
    slots.iter().flatten().next().cloned()
}

/// Selects which channel a just-terminated `line` targets. A leading digit
/// `'0'..='3'` selects that slot; an empty slot at that index, or any
/// non-digit/unrecognized prefix, falls back to the first populated slot
/// (both fallback paths are preserved from the original, see the Open
/// Questions notes in `DESIGN.md`). Returns the selected record (if any
/// channel exists at all) and the number of leading bytes to strip before
/// dispatching.
pub(crate) fn select_channel(
    slots: &[Option<Arc<ChannelRecord>>; 4],
    line: &[u8],
) -> (Option<Arc<ChannelRecord>>, usize) {
    match line.first() {
        Some(&b) if (b'0'..=b'3').contains(&b) => {
            let idx = (b - b'0') as usize;
            match &slots[idx] {
                Some(rec) => (Some(Arc::clone(rec)), 1),
                None => (first_existing(slots), 1),
            }
        }
        _ => (first_existing(slots), 0),
    }
}

impl Port {
    /// Feeds a chunk of freshly-received bytes through the de-escape state
    /// machine (§4.2). Equivalent to calling
    /// [`Port::receive_byte_with_corruption`] for each byte with
    /// `corrupt = false`.
    pub fn receive_bytes(&self, bytes: &[u8]) {
        for &b in bytes {
            self.receive_byte_with_corruption(b, false);
        }
    }

    /// Feeds one received byte through the de-escape state machine. `CR`
    /// (`\r`) and `BEL` (`0x07`) both terminate the current line. Pass
    /// `corrupt = true` when the transport reports the byte itself was
    /// corrupted in flight (e.g. a framing or parity error) instead of its
    /// ordinary value; this latches the same inbound-error state an
    /// overflowing line does and bumps the first channel's `rx_errors`.
    pub fn receive_byte_with_corruption(&self, byte: u8, corrupt: bool) {
        if corrupt {
            let mut inner = self.inner.lock().unwrap();
            inner.rx.inbound_error = true;
            if let Some(rec) = first_existing(&inner.slots) {
                rec.counters.rx_errors.fetch_add(1, Ordering::Relaxed);
            }
            log::warn!("transport reported a corrupted inbound byte");
            return;
        }

        let line = {
            let mut inner = self.inner.lock().unwrap();
            match byte {
                b'\r' | 0x07 => {
                    if inner.rx.buf.is_empty() {
                        inner.rx.inbound_error = false;
                        return;
                    }
                    let had_error = std::mem::replace(&mut inner.rx.inbound_error, false);
                    let line = std::mem::take(&mut inner.rx.buf);
                    if had_error {
                        log::warn!("dropping line received after an inbound error");
                        return;
                    }
                    line
                }
                _ => {
                    if inner.rx.buf.len() >= SLCAN_MTU {
                        inner.rx.inbound_error = true;
                        if let Some(rec) = first_existing(&inner.slots) {
                            rec.counters.rx_over_errors.fetch_add(1, Ordering::Relaxed);
                        }
                        log::warn!("inbound line overflowed the receive buffer");
                        return;
                    }
                    inner.rx.buf.push(byte);
                    return;
                }
            }
        };

        self.handle_line(&line);
    }

    fn handle_line(&self, line: &[u8]) {
        // Mirrors the original's `port->rcount > 4` gate: a terminated line
        // shorter than 5 bytes can never carry a useful record (shortest
        // real records are a channel digit + type + minimal id/dlc, or a
        // state/error record), so it is dropped before channel selection
        // is even attempted.
        if line.len() <= 4 {
            return;
        }

        let record = {
            let inner = self.inner.lock().unwrap();
            let (record, prefix_len) = select_channel(&inner.slots, line);
            record.map(|r| (r, prefix_len))
        };

        let Some((record, prefix_len)) = record else {
            log::warn!("received a line with no channel available to dispatch to");
            return;
        };
        let body = &line[prefix_len..];

        {
            let mut inner = self.inner.lock().unwrap();
            if let Some(expected) = inner.pending_query {
                if body.first() == Some(&expected) {
                    inner.query_reply = Some(body[1..].to_vec());
                    inner.pending_query = None;
                    self.cv.notify_all();
                    return;
                }
            }
        }

        self.dispatch_line(&record, body);
    }

    fn dispatch_line(&self, record: &Arc<ChannelRecord>, body: &[u8]) {
        let Some(&ty) = body.first() else {
            return;
        };

        match ty {
            b't' | b'T' | b'r' | b'R' | b'd' | b'D' | b'b' | b'B' => match frame::decode(body) {
                Ok(frame) => {
                    let len = match &frame {
                        frame::Frame::Classical(f) => f.data.len(),
                        frame::Frame::Fd(f) => f.data.len(),
                    };
                    record.counters.rx_packets.fetch_add(1, Ordering::Relaxed);
                    record.counters.rx_bytes.fetch_add(len as u32, Ordering::Relaxed);
                    self.sink.on_frame(record.index, frame);
                }
                Err(e) => {
                    log::warn!("channel {}: {e}", record.index);
                    record.counters.rx_errors.fetch_add(1, Ordering::Relaxed);
                }
            },
            b'e' => match can_err::decode_legacy_error(&body[1..]) {
                Some(err) => self.sink.on_error_frame(record.index, err),
                None => {
                    record.counters.rx_errors.fetch_add(1, Ordering::Relaxed);
                }
            },
            b'E' => match can_err::decode_structured_error(&body[1..]) {
                Some((state, err, rx_over_events)) => {
                    if rx_over_events > 0 {
                        record
                            .counters
                            .rx_over_errors
                            .fetch_add(rx_over_events, Ordering::Relaxed);
                    }
                    self.apply_state_transition(
                        record,
                        state,
                        err.tx_errors as u32,
                        err.rx_errors as u32,
                        err,
                    )
                }
                None => {
                    record.counters.rx_errors.fetch_add(1, Ordering::Relaxed);
                }
            },
            b's' => match can_err::decode_state(&body[1..]) {
                Some((state, tx, rx, err)) => {
                    self.apply_state_transition(record, state, tx, rx, err)
                }
                None => {
                    record.counters.rx_errors.fetch_add(1, Ordering::Relaxed);
                }
            },
            _ => {
                // Unrecognized leading character: dropped silently, per §4.2.
            }
        }
    }

    fn apply_state_transition(
        &self,
        record: &Arc<ChannelRecord>,
        state: BusState,
        tx_errors: u32,
        rx_errors: u32,
        err: can_err::ErrorFrame,
    ) {
        if record.state() == state {
            return;
        }
        record.set_state(state);
        self.sink.on_state_change(record.index, state, tx_errors, rx_errors);
        self.sink.on_error_frame(record.index, err);
        if state == BusState::BusOff {
            log::error!("channel {} entered bus-off", record.index);
            self.sink.on_bus_off(record.index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelConfig;
    use crate::port::{Port, PortConfig};
    use crate::sink::NetSink;
    use crate::transport::LoopbackTransport;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingSink {
        frames: StdMutex<Vec<(u8, frame::Frame)>>,
        state_changes: StdMutex<Vec<(u8, BusState, u32, u32)>>,
        bus_offs: StdMutex<Vec<u8>>,
        error_frames: StdMutex<Vec<(u8, can_err::ErrorFrame)>>,
    }

    impl NetSink for RecordingSink {
        fn on_frame(&self, channel: u8, frame: frame::Frame) {
            self.frames.lock().unwrap().push((channel, frame));
        }
        fn on_state_change(&self, channel: u8, state: BusState, tx: u32, rx: u32) {
            self.state_changes.lock().unwrap().push((channel, state, tx, rx));
        }
        fn on_bus_off(&self, channel: u8) {
            self.bus_offs.lock().unwrap().push(channel);
        }
        fn on_error_frame(&self, channel: u8, frame: can_err::ErrorFrame) {
            self.error_frames.lock().unwrap().push((channel, frame));
        }
    }

    fn attach(n: usize) -> (Arc<Port>, Vec<crate::channel::Channel>, Arc<RecordingSink>) {
        let transport = Arc::new(LoopbackTransport::new());
        let sink = Arc::new(RecordingSink::default());
        let (port, channels) = Port::attach(
            transport,
            sink.clone(),
            PortConfig::default(),
            vec![ChannelConfig::default(); n],
        )
        .unwrap();
        (port, channels, sink)
    }

    #[test]
    fn receives_and_dispatches_a_frame_on_channel_zero() {
        let (port, _channels, sink) = attach(1);
        port.receive_bytes(b"t1230\r");
        let frames = sink.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 0);
    }

    #[test]
    fn selects_channel_by_leading_digit() {
        let (port, _channels, sink) = attach(4);
        port.receive_bytes(b"2t1230\r");
        assert_eq!(sink.frames.lock().unwrap()[0].0, 2);
    }

    #[test]
    fn falls_back_to_first_channel_for_unknown_prefix() {
        let (port, _channels, sink) = attach(2);
        port.receive_bytes(b"9t1230\r");
        assert_eq!(sink.frames.lock().unwrap()[0].0, 0);
    }

    #[test]
    fn state_record_updates_state_once_and_fires_bus_off() {
        let (port, channels, sink) = attach(1);
        port.receive_bytes(b"sb057033\r");
        assert_eq!(channels[0].state(), BusState::BusOff);
        assert_eq!(sink.bus_offs.lock().unwrap().len(), 1);

        // Same state again: no-op, no second bus-off hook firing.
        port.receive_bytes(b"sb057033\r");
        assert_eq!(sink.bus_offs.lock().unwrap().len(), 1);
    }

    #[test]
    fn overflowing_line_latches_inbound_error_and_drops_it() {
        let (port, channels, sink) = attach(1);
        for _ in 0..SLCAN_MTU + 1 {
            port.receive_byte_with_corruption(b'1', false);
        }
        port.receive_bytes(b"\r");
        assert!(sink.frames.lock().unwrap().is_empty());
        assert_eq!(channels[0].counters().rx_over_errors, 1);
    }

    #[test]
    fn lines_shorter_than_five_bytes_are_dropped_before_dispatch() {
        let (port, channels, sink) = attach(1);
        // "a1\r" terminates at 2 bytes, well under the 5-byte gate, and
        // would otherwise be misread as a bogus frame type and counted as
        // a decode error.
        port.receive_bytes(b"a1\r");
        assert!(sink.frames.lock().unwrap().is_empty());
        assert_eq!(channels[0].counters().rx_errors, 0);
    }

    #[test]
    fn legacy_error_record_forwards_error_frame_to_sink() {
        let (port, _channels, sink) = attach(1);
        port.receive_bytes(b"e3aoO\r");
        let frames = sink.error_frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, 0);
    }

    #[test]
    fn structured_error_record_forwards_error_frame_and_counts_rx_overflow() {
        let (port, channels, sink) = attach(1);
        // fw=09 sets both bit 0x01 and bit 0x08: two rx-overflow events.
        port.receive_bytes(b"E10090000\r");
        assert_eq!(sink.error_frames.lock().unwrap().len(), 1);
        assert_eq!(channels[0].counters().rx_over_errors, 2);
    }

    #[test]
    fn state_record_forwards_error_frame_alongside_state_change() {
        let (port, _channels, sink) = attach(1);
        port.receive_bytes(b"sb057033\r");
        assert_eq!(sink.error_frames.lock().unwrap().len(), 1);
        assert_eq!(sink.state_changes.lock().unwrap().len(), 1);
    }
}
