//! `slcanx` reimplements the logic of the Linux `slcan`/`slcanx` tty line
//! discipline as a host-side, multi-threaded Rust library: the ASCII
//! codec, per-channel bookkeeping, receive parser, transmit pipeline, and
//! command rendezvous for multiplexing up to four logical CAN/CAN-FD
//! interfaces over one shared byte stream.
//!
//! The crate does not open a serial device itself. Callers provide a
//! [`Transport`] (a byte-stream sink/source) and, optionally, a
//! [`NetSink`] to receive decoded frames and bus-state transitions —
//! standing in for the kernel's tty layer and networking stack
//! respectively.
//!
//! ```no_run
//! use std::sync::Arc;
//! use slcanx::{Port, PortConfig, ChannelConfig, NullSink};
//! use slcanx::transport::LoopbackTransport;
//!
//! let transport = Arc::new(LoopbackTransport::new());
//! let (port, mut channels) = Port::attach(
//!     transport,
//!     Arc::new(NullSink),
//!     PortConfig::default(),
//!     vec![ChannelConfig::default()],
//! ).unwrap();
//! let can0 = channels.remove(0);
//! can0.open().unwrap();
//! ```

mod bitrate;
mod can_err;
mod channel;
mod error;
mod frame;
mod parser;
mod port;
pub mod sink;
pub mod transport;

pub use bitrate::{data_bitrate_index, nominal_bitrate_index, DATA_BITRATES, NOMINAL_BITRATES};
pub use can_err::{
    decode_legacy_error, decode_state, decode_structured_error, CtrlErrFlags, CtrlErrFlagsOpt,
    ErrFlags, ErrFlagsOpt, ErrorFrame, ProtErrFlags, ProtErrFlagsOpt, ProtErrLoc,
};
pub use channel::{
    BitTiming, BusState, Channel, ChannelConfig, ChannelCountersSnapshot, CtrlMode, CustomTiming,
};
pub use error::{DecodeErrorKind, SlcanxError, SlcanxResult};
pub use frame::{
    CanFdFrame, CanFrame, Frame, Id, Payload, CLASSICAL_MAX_LEN, FD_DLC_TO_LEN, FD_MAX_LEN,
};
pub use port::{Port, PortConfig, Query, SLCAN_MTU};
pub use sink::{NetSink, NullSink};
pub use transport::Transport;
