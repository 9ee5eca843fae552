//! Wires a [`Port`] to an in-process loopback transport, opens channel 0,
//! sends a frame, and prints whatever the loopback transport captured.
//!
//! This is illustrative only — out of scope per §1 of the driver spec,
//! which treats the serial daemon and transport wiring as the caller's
//! problem. It exists to exercise the crate end to end without a real
//! serial port.

use std::sync::Arc;

use slcanx::transport::LoopbackTransport;
use slcanx::{
    BitTiming, CanFrame, Channel, ChannelConfig, Frame, Id, NullSink, Payload, Port, PortConfig,
};

fn send_and_print(can0: &Channel, transport: &LoopbackTransport) {
    let frame = Frame::Classical(CanFrame {
        id: Id::standard(0x123),
        rtr: false,
        dlc: 3,
        data: Payload::new(&[0x11, 0x22, 0x33]),
    });

    can0.send(&frame).expect("send should succeed");

    let written = transport.take_written();
    println!(
        "wrote {} bytes: {}",
        written.len(),
        String::from_utf8_lossy(&written).replace('\r', "\\r")
    );
}

fn main() {
    env_logger::init();

    let transport = Arc::new(LoopbackTransport::new());
    let config = ChannelConfig {
        nominal: BitTiming {
            bitrate: 500_000,
            ..Default::default()
        },
        ..Default::default()
    };

    let (port, mut channels) = Port::attach(
        transport.clone(),
        Arc::new(NullSink),
        PortConfig::default(),
        vec![config],
    )
    .expect("attach should succeed");

    let can0 = channels.remove(0);
    can0.open().expect("open should succeed");
    println!("channel 0 opened, wrote: {:?}", transport.take_written());

    send_and_print(&can0, &transport);

    can0.close().expect("close should succeed");
    println!("channel 0 closed, wrote: {:?}", transport.take_written());

    port.detach();
}
