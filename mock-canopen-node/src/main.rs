//! # Mock CANopen Node
//!
//! A CANopen node simulator for exercising the SDO client on a virtual bus.
//!
//! This mock node:
//! - Answers SDO uploads and downloads, expedited and segmented
//! - Serves simulated data from a small object dictionary
//! - Accepts writes to its read/write entries and aborts the rest
//! - Regenerates dynamic values (like sensor readings) on every read
//!
//! ## Usage
//!
//! ```bash
//! # Start the mock node on vcan0 with node ID 4
//! RUST_LOG=debug cargo run -p mock-canopen-node -- --interface vcan0 --node-id 4
//! ```

mod object_dictionary;
mod sdo_server;

use std::io;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use socketcan::{CanSocket, Socket};

use object_dictionary::ObjectDictionary;
use sdo_server::SdoServer;

#[derive(Parser, Debug)]
#[command(name = "mock-node", version, about = "Simulated CANopen SDO server")]
struct Args {
    /// SocketCAN interface to listen on
    #[arg(short, long, default_value = "vcan0")]
    interface: String,

    /// Node ID answered by this node
    #[arg(short, long, default_value_t = 4, value_parser = clap::value_parser!(u8).range(1..=127))]
    node_id: u8,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    info!("Mock CANopen node starting on {} as node {}", args.interface, args.node_id);

    let socket = match CanSocket::open(&args.interface) {
        Ok(socket) => socket,
        Err(e) => {
            error!("Failed to open CAN socket {}: {}", args.interface, e);
            error!("Create a virtual CAN interface with:");
            error!("  sudo modprobe vcan");
            error!("  sudo ip link add dev vcan0 type vcan");
            error!("  sudo ip link set up vcan0");
            std::process::exit(1);
        }
    };

    // Read timeout to avoid busy-waiting
    if let Err(e) = socket.set_read_timeout(Duration::from_millis(10)) {
        error!("Failed to set socket timeout: {}", e);
        std::process::exit(1);
    }

    let mut object_dict = ObjectDictionary::new();
    object_dict.add_test_objects(args.node_id);
    let mut sdo_server = SdoServer::new(args.node_id, object_dict);

    info!("Object dictionary loaded with {} entries:", sdo_server.object_dict().len());
    sdo_server.object_dict().log_summary();
    info!(
        "Waiting for SDO requests on COB-ID 0x{:03X}",
        canopen_sdo::frame::request_cob_id(args.node_id)
    );

    loop {
        match socket.read_frame() {
            Ok(frame) => {
                if let Some(response) = sdo_server.handle_frame(&frame) {
                    if let Err(e) = socket.write_frame(&response) {
                        warn!("Failed to send response: {}", e);
                    }
                }
            }
            // Timeout or no data is normal
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => warn!("CAN read error: {}", e),
        }
    }
}
