//! The SDO transfer state machine.
//!
//! A [`Transfer`] owns one upload or download. It never touches the bus
//! itself: every transition returns a [`Step`] telling the caller which frame
//! to send, or that the transfer reached its terminal outcome.

use log::debug;
use tokio::time::Instant;

use crate::abort;
use crate::frame::{self, Indication, SdoFrame, EXPEDITED_MAX};

/// Toggle bit carried by the first segment of a segmented download.
pub const FIRST_SEGMENT_TOGGLE: u8 = 1;

/// Toggle bit of the first upload segment request, as CiA 301 requires.
pub const FIRST_UPLOAD_SEGMENT_TOGGLE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Read from the remote node.
    Upload,
    /// Write to the remote node.
    Download,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Expedited,
    Segmented,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    /// Initiate frame sent, waiting for the server's initiate response.
    Requested,
    ExpeditedAwaitingAck,
    SegmentedInProgress,
    Completed,
    Aborted,
    TimedOut,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted | Self::TimedOut)
    }
}

/// What the caller must do after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// The indication did not concern this transfer; keep waiting.
    Ignored,
    /// Send this frame and keep waiting.
    Send(SdoFrame),
    Completed,
    /// `notify` is set when the abort originates here and the server must
    /// be told.
    Aborted {
        code: u32,
        reason: &'static str,
        notify: Option<SdoFrame>,
    },
    TimedOut { notify: SdoFrame },
}

/// One in-flight SDO operation.
#[derive(Debug)]
pub struct Transfer {
    direction: Direction,
    index: u16,
    sub_index: u8,
    /// Unknown for uploads until the server answers.
    mode: Option<Mode>,
    toggle: u8,
    bytes_transferred: usize,
    /// Unknown for segmented uploads whose server did not indicate a size.
    total_size: Option<usize>,
    data: Vec<u8>,
    deadline: Instant,
    state: State,
}

impl Transfer {
    /// Prepare a write of `raw` to `index:sub_index`.
    pub fn download(index: u16, sub_index: u8, raw: Vec<u8>, deadline: Instant) -> Self {
        let mode = if (1..=EXPEDITED_MAX).contains(&raw.len()) {
            Mode::Expedited
        } else {
            Mode::Segmented
        };

        Self {
            direction: Direction::Download,
            index,
            sub_index,
            mode: Some(mode),
            toggle: FIRST_SEGMENT_TOGGLE,
            bytes_transferred: 0,
            total_size: Some(raw.len()),
            data: raw,
            deadline,
            state: State::Idle,
        }
    }

    /// Prepare a read of `index:sub_index`.
    pub fn upload(index: u16, sub_index: u8, deadline: Instant) -> Self {
        Self {
            direction: Direction::Upload,
            index,
            sub_index,
            mode: None,
            toggle: FIRST_UPLOAD_SEGMENT_TOGGLE,
            bytes_transferred: 0,
            total_size: None,
            data: Vec::new(),
            deadline,
            state: State::Idle,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn sub_index(&self) -> u8 {
        self.sub_index
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    pub fn toggle(&self) -> u8 {
        self.toggle
    }

    pub fn bytes_transferred(&self) -> usize {
        self.bytes_transferred
    }

    /// Exact size of the value, once announced or completed. `None` after an
    /// expedited upload whose server left the size unindicated.
    pub fn total_size(&self) -> Option<usize> {
        self.total_size
    }

    /// Bytes being written (download) or received so far (upload).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Leave `Idle` and return the initiate frame to send.
    pub fn start(&mut self) -> SdoFrame {
        debug_assert_eq!(self.state, State::Idle, "transfer started twice");
        let initiate = frame::encode_initiate(self);

        self.state = match (self.direction, self.mode) {
            (Direction::Download, Some(Mode::Expedited)) => {
                self.bytes_transferred = self.data.len();
                State::ExpeditedAwaitingAck
            }
            _ => State::Requested,
        };

        debug!(
            "{:?} 0x{:04X}:{:02X} started ({:?})",
            self.direction, self.index, self.sub_index, self.state
        );
        initiate
    }

    /// Feed one inbound indication. Terminal transfers ignore everything.
    pub fn on_indication(&mut self, ind: &Indication) -> Step {
        if self.state == State::Idle || self.state.is_terminal() {
            return Step::Ignored;
        }

        if let Some(remote) = ind.abort {
            self.state = State::Aborted;
            return Step::Aborted {
                code: remote.code,
                reason: remote.reason,
                notify: None,
            };
        }

        match self.direction {
            Direction::Download => self.on_download_indication(ind),
            Direction::Upload => self.on_upload_indication(ind),
        }
    }

    /// The deadline elapsed without a qualifying indication.
    pub fn on_timeout(&mut self) -> Step {
        if self.state == State::Idle || self.state.is_terminal() {
            return Step::Ignored;
        }

        self.state = State::TimedOut;
        Step::TimedOut {
            notify: frame::encode_abort(self.index, self.sub_index, abort::PROTOCOL_TIMED_OUT),
        }
    }

    fn on_download_indication(&mut self, ind: &Indication) -> Step {
        let initiate_ack =
            ind.command == frame::INITIATE_DOWNLOAD_RESPONSE && ind.matches(self.index, self.sub_index);

        match self.state {
            State::ExpeditedAwaitingAck if initiate_ack => self.complete(),
            State::Requested if initiate_ack => {
                self.state = State::SegmentedInProgress;
                if self.bytes_transferred == self.data.len() {
                    // Zero-length value: nothing to segment.
                    self.complete()
                } else {
                    self.next_download_segment()
                }
            }
            State::SegmentedInProgress
                if ind.command == frame::DOWNLOAD_SEGMENT_RESPONSE | (self.toggle << 4) =>
            {
                if self.bytes_transferred == self.data.len() {
                    self.complete()
                } else {
                    self.toggle ^= 1;
                    self.next_download_segment()
                }
            }
            _ => Step::Ignored,
        }
    }

    fn next_download_segment(&mut self) -> Step {
        let segment = frame::encode_segment(self);
        let count = frame::SEGMENT_MAX.min(self.data.len() - self.bytes_transferred);
        self.bytes_transferred += count;

        debug!(
            "download segment toggle={} bytes={}/{}",
            self.toggle,
            self.bytes_transferred,
            self.data.len()
        );
        Step::Send(segment)
    }

    fn on_upload_indication(&mut self, ind: &Indication) -> Step {
        match self.state {
            State::Requested
                if ind.is_upload_response() && ind.matches(self.index, self.sub_index) =>
            {
                if ind.is_expedited() {
                    self.mode = Some(Mode::Expedited);
                    self.data = ind.expedited_payload().to_vec();
                    self.bytes_transferred = self.data.len();
                    // Without the size bit all four bytes arrive, padding included
                    self.total_size = ind.is_size_indicated().then_some(self.data.len());
                    self.complete()
                } else {
                    self.mode = Some(Mode::Segmented);
                    self.total_size = ind.is_size_indicated().then(|| ind.size() as usize);
                    self.state = State::SegmentedInProgress;
                    Step::Send(frame::encode_upload_segment_request(self.toggle))
                }
            }
            State::SegmentedInProgress if ind.is_upload_segment() && ind.toggle() == self.toggle => {
                let payload = ind.segment_payload();
                let received = self.bytes_transferred + payload.len();

                if let Some(total) = self.total_size {
                    if received > total {
                        return self.local_abort(abort::LENGTH_TOO_HIGH);
                    }
                    if ind.is_last_segment() && received != total {
                        return self.local_abort(abort::LENGTH_MISMATCH);
                    }
                }

                self.data.extend_from_slice(payload);
                self.bytes_transferred = received;
                self.toggle ^= 1;

                debug!(
                    "upload segment bytes={} last={}",
                    self.bytes_transferred,
                    ind.is_last_segment()
                );

                if ind.is_last_segment() {
                    self.total_size = Some(self.bytes_transferred);
                    self.complete()
                } else {
                    Step::Send(frame::encode_upload_segment_request(self.toggle))
                }
            }
            _ => Step::Ignored,
        }
    }

    fn complete(&mut self) -> Step {
        self.state = State::Completed;
        Step::Completed
    }

    fn local_abort(&mut self, code: u32) -> Step {
        self.state = State::Aborted;
        Step::Aborted {
            code,
            reason: abort::lookup(code),
            notify: Some(frame::encode_abort(self.index, self.sub_index, code)),
        }
    }
}
