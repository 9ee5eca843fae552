//! CAN error-frame bit layout and the legacy/structured error decoders of
//! §4.5. The field names and byte-index mapping follow `linux/can/error.h`
//! closely enough that a caller already familiar with that layout will
//! recognize the shape of [`ErrorFrame`].

use bitflags::bitflags;

bitflags! {
    /// Which classes of information an [`ErrorFrame`] carries, mirroring the
    /// high bits of a Linux CAN error frame's `can_id`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ErrFlags: u32 {
        /// Bus-off condition entered.
        const BUSOFF = 0x0000_0040;
        /// Controller/firmware problem, see [`CtrlErrFlags`].
        const CRTL = 0x0000_0004;
        /// Protocol violation, see [`ProtErrFlags`].
        const PROT = 0x0000_0008;
        /// ACK slot error.
        const ACK = 0x0000_0020;
        /// `tx_errors`/`rx_errors` counters are valid.
        const CNT = 0x0000_0200;
        /// Generic bus error.
        const BUSERROR = 0x0000_0080;
    }
}

bitflags! {
    /// Controller/firmware error bits (`data[1]` of a Linux CAN error frame).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CtrlErrFlags: u8 {
        /// Receive buffer overflowed.
        const RX_OVERFLOW = 0x01;
        /// Transmit buffer overflowed.
        const TX_OVERFLOW = 0x02;
        /// Receive error-warning threshold reached.
        const RX_WARNING = 0x04;
        /// Transmit error-warning threshold reached.
        const TX_WARNING = 0x08;
        /// Receive error-passive threshold reached.
        const RX_PASSIVE = 0x10;
        /// Transmit error-passive threshold reached.
        const TX_PASSIVE = 0x20;
        /// Controller is error-active.
        const ACTIVE = 0x40;
    }
}

bitflags! {
    /// Protocol error bits (`data[2]` of a Linux CAN error frame).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProtErrFlags: u8 {
        /// Single bit error.
        const BIT = 0x01;
        /// Frame format error.
        const FORM = 0x02;
        /// Bit stuffing error.
        const STUFF = 0x04;
        /// Unable to send a dominant bit.
        const BIT0 = 0x08;
        /// Unable to send a recessive bit.
        const BIT1 = 0x10;
        /// Bus overload.
        const OVERLOAD = 0x20;
        /// Active error announcement.
        const ACTIVE = 0x40;
        /// Error occurred on transmission.
        const TX = 0x80;
    }
}

/// Where in the frame a protocol error was localized (`data[3]`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtErrLoc {
    /// CRC sequence field.
    CrcSeq,
    /// ACK slot.
    Ack,
}

/// A synthesized CAN error frame, analogous to the `can_frame` a real
/// controller emits with `CAN_ERR_FLAG` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorFrame {
    /// High-level classification bits.
    pub flags: ErrFlagsOpt,
    /// Controller/firmware bits.
    pub ctrl: CtrlErrFlagsOpt,
    /// Protocol violation bits.
    pub prot: ProtErrFlagsOpt,
    /// Where the protocol error was localized, if known.
    pub prot_loc: Option<ProtErrLoc>,
    /// Transmit error counter (`data[6]`).
    pub tx_errors: u8,
    /// Receive error counter (`data[7]`).
    pub rx_errors: u8,
}

/// `bitflags` types don't implement `Default` as `empty()` pre-2.0 style
/// uniformly across crate versions in this pack, so these thin newtypes
/// pin it down explicitly and forward everything else to the inner type.
macro_rules! default_wrapper {
    ($name:ident, $inner:ty) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub struct $name(pub $inner);

        impl Default for $name {
            fn default() -> Self {
                $name(<$inner>::empty())
            }
        }

        impl std::ops::Deref for $name {
            type Target = $inner;
            fn deref(&self) -> &$inner {
                &self.0
            }
        }

        impl std::ops::DerefMut for $name {
            fn deref_mut(&mut self) -> &mut $inner {
                &mut self.0
            }
        }

        impl From<$inner> for $name {
            fn from(v: $inner) -> Self {
                $name(v)
            }
        }
    };
}

default_wrapper!(ErrFlagsOpt, ErrFlags);
default_wrapper!(CtrlErrFlagsOpt, CtrlErrFlags);
default_wrapper!(ProtErrFlagsOpt, ProtErrFlags);

/// Decodes a legacy `e<len><tags>` error record (without the leading `e`,
/// already stripped). `len` is the decimal digit naming how many tag
/// characters follow. Unknown tags abort the whole record, matching the
/// original's `goto decode_failed` behavior.
pub fn decode_legacy_error(body: &[u8]) -> Option<ErrorFrame> {
    if body.is_empty() {
        return None;
    }
    let len_char = body[0];
    if !(b'0'..=b'9').contains(&len_char) {
        return None;
    }
    let len = (len_char - b'0') as usize;
    if body.len() < 1 + len {
        return None;
    }

    let mut frame = ErrorFrame {
        flags: ErrFlagsOpt(ErrFlags::PROT | ErrFlags::BUSERROR),
        ..Default::default()
    };

    for &tag in &body[1..1 + len] {
        match tag {
            b'a' => {
                frame.flags.0 |= ErrFlags::ACK;
                frame.prot_loc = Some(ProtErrLoc::Ack);
            }
            b'b' => frame.prot.0 |= ProtErrFlags::BIT0,
            b'B' => frame.prot.0 |= ProtErrFlags::BIT1,
            b'c' => {
                frame.prot.0 |= ProtErrFlags::BIT;
                frame.prot_loc = Some(ProtErrLoc::CrcSeq);
            }
            b'f' => frame.prot.0 |= ProtErrFlags::FORM,
            b'o' => {
                frame.flags.0 |= ErrFlags::CRTL;
                // Last write wins, matching the reference's documented
                // (not OR-ed) overwrite of data[1] when both o and O appear.
                frame.ctrl.0 = CtrlErrFlags::RX_OVERFLOW;
            }
            b'O' => {
                frame.flags.0 |= ErrFlags::CRTL;
                frame.ctrl.0 = CtrlErrFlags::TX_OVERFLOW;
            }
            b's' => frame.prot.0 |= ProtErrFlags::STUFF,
            _ => {
                log::warn!("unknown legacy error tag {:?}", tag as char);
                return None;
            }
        }
    }

    Some(frame)
}

/// Decodes a structured `E<busstatus><lastprot><fw:2><tx:2><rx:2>` record
/// (without the leading `E`, already stripped). Returns the decoded bus
/// status, the synthesized frame, and the number of separate rx-overflow
/// events the firmware-error byte reports (0, 1, or 2 — bits `0x01` and
/// `0x08` each name a distinct overflow site in the original driver, see
/// `can_err::tests::structured_error_double_counts_rx_overflow`), since the
/// caller needs all three to decide whether to invoke the bus-off hook and
/// how far to bump `rx_over_errors`.
pub fn decode_structured_error(
    body: &[u8],
) -> Option<(crate::channel::BusState, ErrorFrame, u32)> {
    if body.len() < 8 {
        return None;
    }

    let state = match body[0] {
        b'0' => crate::channel::BusState::ErrorActive,
        b'1' => crate::channel::BusState::ErrorWarning,
        b'2' => crate::channel::BusState::ErrorPassive,
        b'3' => crate::channel::BusState::BusOff,
        _ => crate::channel::BusState::ErrorActive,
    };

    let mut frame = ErrorFrame {
        flags: ErrFlagsOpt(ErrFlags::PROT | ErrFlags::BUSERROR),
        ..Default::default()
    };

    match body[1] {
        b'0' => {}
        b'1' => frame.prot.0 |= ProtErrFlags::STUFF,
        b'2' => frame.prot.0 |= ProtErrFlags::FORM,
        b'3' => {
            frame.flags.0 |= ErrFlags::ACK;
            frame.prot_loc = Some(ProtErrLoc::Ack);
        }
        b'4' => frame.prot.0 |= ProtErrFlags::BIT1,
        b'5' => frame.prot.0 |= ProtErrFlags::BIT0,
        b'6' => frame.prot_loc = Some(ProtErrLoc::CrcSeq),
        _ => {}
    }

    let mut rx_over_events = 0u32;

    if let Some(fw_err) = hex_byte(body[2], body[3]) {
        if fw_err & 0x01 != 0 {
            frame.flags.0 |= ErrFlags::CRTL;
            frame.ctrl.0 |= CtrlErrFlags::RX_OVERFLOW;
            rx_over_events += 1;
        }
        if fw_err & 0x04 != 0 {
            frame.flags.0 |= ErrFlags::CRTL;
            frame.ctrl.0 |= CtrlErrFlags::TX_OVERFLOW;
        }
        if fw_err & 0x08 != 0 {
            frame.flags.0 |= ErrFlags::CRTL;
            frame.ctrl.0 |= CtrlErrFlags::RX_OVERFLOW;
            rx_over_events += 1;
        }
    }

    if let Some(tx) = hex_byte(body[4], body[5]) {
        frame.tx_errors = tx;
    }
    if let Some(rx) = hex_byte(body[6], body[7]) {
        frame.rx_errors = rx;
    }

    frame.flags.0 |= ErrFlags::CNT;

    Some((state, frame, rx_over_events))
}

/// Decodes an `s<STATE><TXCNT:3><RXCNT:3>` bus-state record (without the
/// leading `s`, already stripped), e.g. `a057033` for error-active with a
/// tx count of 57 and an rx count of 33. Also computes the per-direction
/// derived state (tx-state/rx-state, §4.5) and folds it into the
/// synthesized error frame's `CtrlErrFlags`: a direction only picks up the
/// new severity's bit when its own count is at least the other direction's
/// (`txcount >= rxcount` for tx, `txcount <= rxcount` for rx); otherwise
/// that direction is unaffected by this transition.
pub fn decode_state(
    body: &[u8],
) -> Option<(crate::channel::BusState, u32, u32, ErrorFrame)> {
    if body.len() < 7 {
        return None;
    }

    let state = match body[0] {
        b'a' => crate::channel::BusState::ErrorActive,
        b'w' => crate::channel::BusState::ErrorWarning,
        b'p' => crate::channel::BusState::ErrorPassive,
        b'b' => crate::channel::BusState::BusOff,
        _ => return None,
    };

    let tx = decimal_u32(&body[1..4])?;
    let rx = decimal_u32(&body[4..7])?;

    let mut frame = ErrorFrame {
        flags: ErrFlagsOpt(ErrFlags::CNT),
        tx_errors: tx.min(u8::MAX as u32) as u8,
        rx_errors: rx.min(u8::MAX as u32) as u8,
        ..Default::default()
    };

    let tx_state = (tx >= rx).then_some(state);
    let rx_state = (tx <= rx).then_some(state);

    if let Some(s) = tx_state {
        match s {
            crate::channel::BusState::ErrorWarning => frame.ctrl.0 |= CtrlErrFlags::TX_WARNING,
            crate::channel::BusState::ErrorPassive => frame.ctrl.0 |= CtrlErrFlags::TX_PASSIVE,
            crate::channel::BusState::ErrorActive => frame.ctrl.0 |= CtrlErrFlags::ACTIVE,
            _ => {}
        }
    }
    if let Some(s) = rx_state {
        match s {
            crate::channel::BusState::ErrorWarning => frame.ctrl.0 |= CtrlErrFlags::RX_WARNING,
            crate::channel::BusState::ErrorPassive => frame.ctrl.0 |= CtrlErrFlags::RX_PASSIVE,
            crate::channel::BusState::ErrorActive => frame.ctrl.0 |= CtrlErrFlags::ACTIVE,
            _ => {}
        }
    }
    if !frame.ctrl.0.is_empty() {
        frame.flags.0 |= ErrFlags::CRTL;
    }
    if state == crate::channel::BusState::BusOff {
        frame.flags.0 |= ErrFlags::BUSOFF;
    }

    Some((state, tx, rx, frame))
}

fn decimal_u32(digits: &[u8]) -> Option<u32> {
    let mut v: u32 = 0;
    for &d in digits {
        if !d.is_ascii_digit() {
            return None;
        }
        v = v * 10 + (d - b'0') as u32;
    }
    Some(v)
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

fn hex_byte(hi: u8, lo: u8) -> Option<u8> {
    Some((hex_nibble(hi)? << 4) | hex_nibble(lo)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_error_ack_rx_overrun_tx_overrun() {
        // e3aoO -> 3 tags: a (ACK/tx), o (rx overrun), O (tx overrun)
        let frame = decode_legacy_error(b"3aoO").unwrap();
        assert!(frame.flags.contains(ErrFlags::ACK));
        // last write wins: O overwrites the ctrl byte that o set
        assert_eq!(frame.ctrl.0, CtrlErrFlags::TX_OVERFLOW);
    }

    #[test]
    fn legacy_error_unknown_tag_aborts() {
        assert!(decode_legacy_error(b"1z").is_none());
    }

    #[test]
    fn structured_error_decodes_counters() {
        // busstatus=0 (active), lastprot=0 (none), fw=00, tx=21, rx=10
        let (state, frame, rx_over_events) = decode_structured_error(b"00002110").unwrap();
        assert_eq!(state, crate::channel::BusState::ErrorActive);
        assert_eq!(frame.tx_errors, 0x21);
        assert_eq!(frame.rx_errors, 0x10);
        assert_eq!(rx_over_events, 0);
    }

    #[test]
    fn structured_error_busoff() {
        let (state, _frame, _rx_over_events) = decode_structured_error(b"30000000").unwrap();
        assert_eq!(state, crate::channel::BusState::BusOff);
    }

    #[test]
    fn structured_error_double_counts_rx_overflow() {
        // fw=09 sets both bit 0x01 and bit 0x08, each a distinct rx-overflow
        // site in the original driver, so both bump the counter.
        let (_state, frame, rx_over_events) = decode_structured_error(b"00090000").unwrap();
        assert!(frame.ctrl.contains(CtrlErrFlags::RX_OVERFLOW));
        assert_eq!(rx_over_events, 2);
    }

    #[test]
    fn state_record_parses_counters() {
        let (state, tx, rx, frame) = decode_state(b"a057033").unwrap();
        assert_eq!(state, crate::channel::BusState::ErrorActive);
        assert_eq!(tx, 57);
        assert_eq!(rx, 33);
        assert_eq!(frame.tx_errors, 57);
        assert_eq!(frame.rx_errors, 33);
    }

    #[test]
    fn state_record_rejects_unknown_letter() {
        assert!(decode_state(b"x057033").is_none());
    }

    #[test]
    fn state_record_computes_per_direction_derived_state() {
        // txcount (33) < rxcount (57): tx side does not reach the new
        // severity, only rx does.
        let (_state, _tx, _rx, frame) = decode_state(b"w033057").unwrap();
        assert!(frame.ctrl.contains(CtrlErrFlags::RX_WARNING));
        assert!(!frame.ctrl.contains(CtrlErrFlags::TX_WARNING));
    }

    #[test]
    fn state_record_passive_both_directions_when_counts_equal() {
        let (_state, _tx, _rx, frame) = decode_state(b"p100100").unwrap();
        assert!(frame.ctrl.contains(CtrlErrFlags::RX_PASSIVE));
        assert!(frame.ctrl.contains(CtrlErrFlags::TX_PASSIVE));
    }
}
