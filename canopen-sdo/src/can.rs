//! SocketCAN transport and reader task.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Id, Socket, StandardId};
use tokio::task::JoinHandle;

use crate::frame::SdoFrame;
use crate::transport::{Dispatcher, Transport};

/// A SocketCAN interface shared by the reader task and senders.
#[derive(Clone)]
pub struct CanBus {
    socket: Arc<Mutex<CanSocket>>,
}

impl CanBus {
    /// Open `interface` (e.g. `vcan0`) in non-blocking mode.
    pub fn open(interface: &str) -> io::Result<Self> {
        let socket = CanSocket::open(interface)?;
        socket.set_nonblocking(true)?;
        info!("CAN socket {} opened", interface);

        Ok(Self {
            socket: Arc::new(Mutex::new(socket)),
        })
    }

    /// Spawn the task feeding every received data frame to `dispatcher`.
    pub fn spawn_reader(&self, dispatcher: Dispatcher) -> JoinHandle<()> {
        let socket = self.socket.clone();

        tokio::spawn(async move {
            loop {
                let frame = {
                    let socket = socket.lock().unwrap_or_else(PoisonError::into_inner);
                    socket.read_frame()
                };

                match frame {
                    Ok(CanFrame::Data(frame)) => {
                        if let Id::Standard(id) = frame.id() {
                            dispatcher.publish(id.as_raw(), frame.data());
                        }
                    }
                    Ok(_) => {} // remote and error frames
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                        // No frame available, sleep briefly
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Err(err) => {
                        warn!("CAN read error: {}", err);
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                }
            }
        })
    }
}

impl Transport for CanBus {
    fn send(&self, cob_id: u16, frame: &SdoFrame) -> io::Result<()> {
        let id = StandardId::new(cob_id)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Invalid CAN ID"))?;
        let can_frame = CanFrame::new(id, frame.as_bytes())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "Failed to create CAN frame"))?;

        debug!("-> 0x{:03X} {:02X?}", cob_id, frame.as_bytes());
        let socket = self.socket.lock().unwrap_or_else(PoisonError::into_inner);
        socket.write_frame(&can_frame)
    }
}
