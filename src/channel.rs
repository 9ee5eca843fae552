//! Per-logical-interface state: bit timing, control mode, counters, bus
//! state, and the `Channel` handle applications hold (§3 "Channel record",
//! §4.6 open/close sequences).

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use bitflags::bitflags;

use crate::bitrate;
use crate::error::{SlcanxError, SlcanxResult};
use crate::frame::Frame;
use crate::port::Port;

bitflags! {
    /// Control-mode bits supported by a channel, mirroring
    /// `CAN_CTRLMODE_LISTENONLY`/`CAN_CTRLMODE_FD`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CtrlMode: u32 {
        /// Bus-on without acknowledgment.
        const LISTEN_ONLY = 0x01;
        /// CAN-FD frames may be sent/received on this channel.
        const FD_ENABLED = 0x02;
    }
}

/// Bus state of a channel, monotonic for a given stream of state-change
/// records (§3 invariants).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// Normal operation.
    ErrorActive,
    /// Error counters elevated but still transmitting normally.
    ErrorWarning,
    /// Error-passive: may only send recessive-bit error flags.
    ErrorPassive,
    /// Bus-off: transmission halted until explicit reset.
    BusOff,
    /// The channel has never been opened, or has been closed.
    Stopped,
}

/// A single nominal or data bit-timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BitTiming {
    /// Bitrate in bit/s. `0` means "unconfigured". Ignored when `custom` is
    /// set, since the `a`/`A` command supersedes the table/arbitrary-rate
    /// commands entirely.
    pub bitrate: u32,
    /// Sample point in tenths of a percent (`750..875`), if explicit.
    pub sample_point: Option<u16>,
    /// Explicit register-level timing (`a`/`A` command), used instead of a
    /// table index or an arbitrary-bitrate command when set.
    pub custom: Option<CustomTiming>,
}

/// Custom bit timing fields for the `a`/`A` command (`CLK_PRE_SEG1_SEG2_
/// SJW_TDC`), used instead of a table index when the caller needs it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CustomTiming {
    /// Controller clock frequency, Hz.
    pub clk: u32,
    /// Prescaler.
    pub prescaler: u32,
    /// Phase segment 1 (including propagation segment), time quanta.
    pub seg1: u32,
    /// Phase segment 2, time quanta.
    pub seg2: u32,
    /// Synchronization jump width, time quanta.
    pub sjw: u32,
    /// Transmitter delay compensation offset, time quanta.
    pub tdc: u32,
}

/// Per-channel configuration, set while the channel is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelConfig {
    /// Nominal (arbitration phase) bit timing.
    pub nominal: BitTiming,
    /// Data-phase bit timing, required when `ctrl_mode` has `FD_ENABLED`.
    pub data: Option<BitTiming>,
    /// Control-mode bits.
    pub ctrl_mode: CtrlMode,
    /// Whether to issue `F\r` (read-and-clear error flags) on open — the
    /// `CF_ERR_RST` latch.
    pub err_reset_on_open: bool,
    /// Legacy BTR register value (`b<hex>\r`, at most 8 hex digits), used
    /// instead of `nominal`'s table index or arbitrary rate when set and
    /// `nominal.custom` is not. Open's priority order for selecting the
    /// nominal timing command is: `nominal.custom` (`a<fields>`), then
    /// `legacy_btr` (`b<hex>`), then the `S0..S8` table, then an arbitrary
    /// `y<decimal>` rate.
    pub legacy_btr: Option<u32>,
}

/// Snapshot of a channel's packet/byte/error counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelCountersSnapshot {
    /// Frames successfully received.
    pub rx_packets: u32,
    /// Frames successfully transmitted.
    pub tx_packets: u32,
    /// Payload bytes received (non-RTR frames only).
    pub rx_bytes: u32,
    /// Payload bytes transmitted (non-RTR frames only).
    pub tx_bytes: u32,
    /// Lines that failed to decode on this channel.
    pub rx_errors: u32,
    /// Transmission-side errors reported by the device.
    pub tx_errors: u32,
    /// Inbound lines dropped due to buffer overflow.
    pub rx_over_errors: u32,
    /// Frames dropped (e.g. allocation failure in the original driver).
    pub dropped: u32,
}

/// Atomic packet/byte/error counters. Written only from the single receive
/// path or the single encoder path; read by observers with relaxed
/// ordering, matching §5's "Shared resources" note.
#[derive(Debug, Default)]
pub struct ChannelCounters {
    pub(crate) rx_packets: AtomicU32,
    pub(crate) tx_packets: AtomicU32,
    pub(crate) rx_bytes: AtomicU32,
    pub(crate) tx_bytes: AtomicU32,
    pub(crate) rx_errors: AtomicU32,
    pub(crate) tx_errors: AtomicU32,
    pub(crate) rx_over_errors: AtomicU32,
    pub(crate) dropped: AtomicU32,
}

impl ChannelCounters {
    fn snapshot(&self) -> ChannelCountersSnapshot {
        ChannelCountersSnapshot {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            rx_over_errors: self.rx_over_errors.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Per-channel state owned by the port, indexed `0..=3`.
#[derive(Debug)]
pub struct ChannelRecord {
    pub(crate) index: u8,
    pub(crate) config: std::sync::Mutex<ChannelConfig>,
    pub(crate) state: AtomicU8,
    pub(crate) counters: ChannelCounters,
    pub(crate) open: std::sync::atomic::AtomicBool,
}

fn state_to_u8(state: BusState) -> u8 {
    match state {
        BusState::ErrorActive => 0,
        BusState::ErrorWarning => 1,
        BusState::ErrorPassive => 2,
        BusState::BusOff => 3,
        BusState::Stopped => 4,
    }
}

fn u8_to_state(v: u8) -> BusState {
    match v {
        0 => BusState::ErrorActive,
        1 => BusState::ErrorWarning,
        2 => BusState::ErrorPassive,
        3 => BusState::BusOff,
        _ => BusState::Stopped,
    }
}

impl ChannelRecord {
    pub(crate) fn new(index: u8, config: ChannelConfig) -> Arc<Self> {
        Arc::new(ChannelRecord {
            index,
            config: std::sync::Mutex::new(config),
            state: AtomicU8::new(state_to_u8(BusState::Stopped)),
            counters: ChannelCounters::default(),
            open: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub(crate) fn state(&self) -> BusState {
        u8_to_state(self.state.load(Ordering::Relaxed))
    }

    pub(crate) fn set_state(&self, state: BusState) {
        self.state.store(state_to_u8(state), Ordering::Relaxed);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Relaxed)
    }
}

/// A logical CAN/CAN-FD interface multiplexed over a shared [`Port`].
///
/// Every channel is FD-capable; a classical frame sent on an FD-enabled
/// channel is still encoded classically (§4.6 "Interface MTU").
#[derive(Clone)]
pub struct Channel {
    pub(crate) port: Arc<Port>,
    pub(crate) record: Arc<ChannelRecord>,
}

impl Channel {
    /// This channel's index in `0..=3`.
    pub fn index(&self) -> u8 {
        self.record.index
    }

    /// Current bus state.
    pub fn state(&self) -> BusState {
        self.record.state()
    }

    /// Snapshot of this channel's counters.
    pub fn counters(&self) -> ChannelCountersSnapshot {
        self.record.counters.snapshot()
    }

    /// True if the channel has been opened and not yet closed.
    pub fn is_open(&self) -> bool {
        self.record.is_open()
    }

    /// Replaces this channel's configuration. Only valid while closed,
    /// matching the original's "set_ids prior to open" convention.
    pub fn set_config(&self, config: ChannelConfig) -> SlcanxResult<()> {
        if self.record.is_open() {
            return Err(SlcanxError::ConfigurationInvalid(
                "channel must be closed to reconfigure",
            ));
        }
        *self.record.config.lock().unwrap() = config;
        Ok(())
    }

    /// Reads back the current configuration.
    pub fn config(&self) -> ChannelConfig {
        *self.record.config.lock().unwrap()
    }

    /// Runs the §4.6 open sequence: `C`+`S<idx>` (and optional sample
    /// point), `Y<hex>`/`Y0`, `F` if latched, then `L`/`O`.
    pub fn open(&self) -> SlcanxResult<()> {
        let config = self.config();

        if config.nominal.bitrate == 0 && config.nominal.custom.is_none() && config.legacy_btr.is_none() {
            // No bitrate configured at all: the original driver substitutes
            // a sentinel "unknown" bitrate and brings the interface up
            // without transmitting any configuration command.
            self.record.set_state(BusState::ErrorActive);
            self.record.open.store(true, Ordering::Relaxed);
            return Ok(());
        }

        // Nominal timing command: custom register fields take priority
        // over a legacy BTR register, which in turn takes priority over
        // the `S0..S8` table, which falls back to an arbitrary `y<decimal>`
        // rate for bitrates outside the table.
        let nominal_cmd = if let Some(custom) = config.nominal.custom {
            format!("a{}\r", bitrate::format_custom_timing(&custom))
        } else if let Some(btr) = config.legacy_btr {
            format!("b{:X}\r", btr)
        } else if let Some(idx) = bitrate::nominal_bitrate_index(config.nominal.bitrate) {
            format!("S{}\r", idx)
        } else if bitrate::ARBITRARY_BITRATE_RANGE.contains(&config.nominal.bitrate) {
            format!("y{}\r", config.nominal.bitrate)
        } else {
            return Err(SlcanxError::ConfigurationInvalid("unsupported nominal bitrate"));
        };

        let cmd = format!("C\r{}", nominal_cmd);
        self.port.transmit_command(self.record.index, cmd.as_bytes())?;

        if config.nominal.custom.is_none() {
            if let Some(sp) = config.nominal.sample_point {
                let sp = bitrate::clamp_sample_point(sp);
                let cmd = format!("p{}\r", sp);
                self.port.transmit_command(self.record.index, cmd.as_bytes())?;
            }
        }

        if config.ctrl_mode.contains(CtrlMode::FD_ENABLED) {
            let data = config.data.ok_or(SlcanxError::ConfigurationInvalid(
                "CAN FD requested without data bitrate",
            ))?;
            if data.bitrate == 0 && data.custom.is_none() {
                return Err(SlcanxError::ConfigurationInvalid(
                    "CAN FD requested without data bitrate",
                ));
            }

            let data_cmd = if let Some(custom) = data.custom {
                format!("A{}\r", bitrate::format_custom_timing(&custom))
            } else {
                let idx = bitrate::data_bitrate_index(data.bitrate).ok_or(
                    SlcanxError::ConfigurationInvalid("unsupported data bitrate for FD mode"),
                )?;
                format!("Y{:X}\r", idx)
            };
            self.port.transmit_command(self.record.index, data_cmd.as_bytes())?;

            if data.custom.is_none() {
                if let Some(sp) = data.sample_point {
                    let sp = bitrate::clamp_sample_point(sp);
                    let cmd = format!("P{}\r", sp);
                    self.port.transmit_command(self.record.index, cmd.as_bytes())?;
                }
            }
        } else {
            self.port.transmit_command(self.record.index, b"Y0\r")?;
        }

        if config.err_reset_on_open {
            self.port.transmit_command(self.record.index, b"F\r")?;
        }

        if config.ctrl_mode.contains(CtrlMode::LISTEN_ONLY) {
            self.port.transmit_command(self.record.index, b"L\r")?;
        } else {
            self.port.transmit_command(self.record.index, b"O\r")?;
        }

        self.record.set_state(BusState::ErrorActive);
        self.record.open.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Runs the §4.6 close sequence: `C\r`, flush the drain task, stop
    /// accepting sends.
    pub fn close(&self) -> SlcanxResult<()> {
        let config = self.config();
        self.record.open.store(false, Ordering::Relaxed);

        if config.nominal.bitrate != 0 || config.nominal.custom.is_some() || config.legacy_btr.is_some() {
            if let Err(e) = self.port.transmit_command(self.record.index, b"C\r") {
                log::warn!(
                    "channel {}: failed to send close command: {e}",
                    self.record.index
                );
            }
        }

        self.port.flush();
        self.record.set_state(BusState::Stopped);
        Ok(())
    }

    /// Sends a frame on this channel (§4.3).
    pub fn send(&self, frame: &Frame) -> SlcanxResult<()> {
        if !self.record.is_open() {
            return Err(SlcanxError::NotOpen);
        }
        self.port.append_encoded(self.record.index, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::{Port, PortConfig};
    use crate::sink::NullSink;
    use crate::transport::LoopbackTransport;

    fn attach_one(config: ChannelConfig) -> (Channel, Arc<LoopbackTransport>) {
        let transport = Arc::new(LoopbackTransport::new());
        let (_port, mut channels) = Port::attach(
            transport.clone(),
            Arc::new(NullSink),
            PortConfig::default(),
            vec![config],
        )
        .unwrap();
        (channels.remove(0), transport)
    }

    #[test]
    fn open_falls_back_to_arbitrary_rate_outside_the_table() {
        let config = ChannelConfig {
            nominal: BitTiming {
                bitrate: 83_333,
                ..Default::default()
            },
            ..Default::default()
        };
        let (ch, transport) = attach_one(config);
        ch.open().unwrap();
        let written = transport.take_written();
        let written = String::from_utf8(written).unwrap();
        assert!(written.contains("y83333\r"), "{written}");
    }

    #[test]
    fn open_rejects_bitrate_outside_the_arbitrary_range() {
        let config = ChannelConfig {
            nominal: BitTiming {
                bitrate: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let (ch, _transport) = attach_one(config);
        assert!(ch.open().is_err());
    }

    #[test]
    fn open_uses_legacy_btr_register_when_set() {
        let config = ChannelConfig {
            legacy_btr: Some(0x1C),
            ..Default::default()
        };
        let (ch, transport) = attach_one(config);
        ch.open().unwrap();
        let written = String::from_utf8(transport.take_written()).unwrap();
        assert!(written.contains("b1C\r"), "{written}");
    }

    #[test]
    fn open_prefers_custom_nominal_timing_over_legacy_btr() {
        let custom = CustomTiming {
            clk: 80_000_000,
            prescaler: 4,
            seg1: 13,
            seg2: 2,
            sjw: 1,
            tdc: 0,
        };
        let config = ChannelConfig {
            nominal: BitTiming {
                custom: Some(custom),
                ..Default::default()
            },
            legacy_btr: Some(0x1C),
            ..Default::default()
        };
        let (ch, transport) = attach_one(config);
        ch.open().unwrap();
        let written = String::from_utf8(transport.take_written()).unwrap();
        assert!(written.contains("a80000000_4_13_2_1_0\r"), "{written}");
    }

    #[test]
    fn open_sends_custom_data_timing_for_fd() {
        let custom = CustomTiming {
            clk: 80_000_000,
            prescaler: 1,
            seg1: 30,
            seg2: 8,
            sjw: 4,
            tdc: 1,
        };
        let config = ChannelConfig {
            nominal: BitTiming {
                bitrate: 500_000,
                ..Default::default()
            },
            data: Some(BitTiming {
                custom: Some(custom),
                ..Default::default()
            }),
            ctrl_mode: CtrlMode::FD_ENABLED,
            ..Default::default()
        };
        let (ch, transport) = attach_one(config);
        ch.open().unwrap();
        let written = String::from_utf8(transport.take_written()).unwrap();
        assert!(written.contains("A80000000_1_30_8_4_1\r"), "{written}");
        assert!(!written.contains("Y0\r"));
    }

    #[test]
    fn ctrl_mode_bits_are_independent() {
        let mode = CtrlMode::LISTEN_ONLY | CtrlMode::FD_ENABLED;
        assert!(mode.contains(CtrlMode::LISTEN_ONLY));
        assert!(mode.contains(CtrlMode::FD_ENABLED));
        assert!(!CtrlMode::FD_ENABLED.contains(CtrlMode::LISTEN_ONLY));
    }

    #[test]
    fn state_round_trips_through_u8_encoding() {
        for s in [
            BusState::ErrorActive,
            BusState::ErrorWarning,
            BusState::ErrorPassive,
            BusState::BusOff,
            BusState::Stopped,
        ] {
            assert_eq!(u8_to_state(state_to_u8(s)), s);
        }
    }
}
