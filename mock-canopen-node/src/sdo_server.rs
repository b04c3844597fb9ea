//! SDO server answering expedited and segmented uploads and downloads

use canopen_sdo::abort;
use canopen_sdo::frame::{self, Indication, SdoFrame, EXPEDITED_MAX, SEGMENT_MAX};
use canopen_sdo::transfer::FIRST_UPLOAD_SEGMENT_TOGGLE;
use canopen_sdo::DataType;
use log::{debug, info, warn};
use socketcan::{CanFrame, EmbeddedFrame, Id, StandardId};

use crate::object_dictionary::ObjectDictionary;

// Client command specifiers (bits 7-5 of the command byte)
const CCS_DOWNLOAD_SEGMENT: u8 = 0;
const CCS_INITIATE_DOWNLOAD: u8 = 1;
const CCS_INITIATE_UPLOAD: u8 = 2;
const CCS_UPLOAD_SEGMENT: u8 = 3;
const CCS_ABORT: u8 = 4;

/// Transfer in progress with the client.
#[derive(Debug, Default)]
enum Session {
    #[default]
    Idle,
    Download {
        index: u16,
        sub_index: u8,
        expected: Option<usize>,
        toggle: Option<u8>,
        buffer: Vec<u8>,
    },
    Upload {
        index: u16,
        sub_index: u8,
        data: Vec<u8>,
        offset: usize,
        /// Toggle the next segment request must carry.
        toggle: u8,
    },
}

pub struct SdoServer {
    node_id: u8,
    object_dict: ObjectDictionary,
    session: Session,
    request_cob_id: u16,  // 0x600 + node_id
    response_cob_id: u16, // 0x580 + node_id
}

impl SdoServer {
    pub fn new(node_id: u8, object_dict: ObjectDictionary) -> Self {
        Self {
            node_id,
            object_dict,
            session: Session::Idle,
            request_cob_id: frame::request_cob_id(node_id),
            response_cob_id: frame::response_cob_id(node_id),
        }
    }

    pub fn object_dict(&self) -> &ObjectDictionary {
        &self.object_dict
    }

    /// Handle an incoming CAN frame.
    /// Returns the response frame if this was an SDO request for us.
    pub fn handle_frame(&mut self, can_frame: &CanFrame) -> Option<CanFrame> {
        let Id::Standard(id) = can_frame.id() else {
            return None; // extended IDs are not SDO
        };
        if id.as_raw() != self.request_cob_id {
            return None;
        }

        let data: [u8; 8] = match can_frame.data().try_into() {
            Ok(data) => data,
            Err(_) => {
                warn!("Node {}: ignoring SDO request with {} bytes", self.node_id, can_frame.data().len());
                return None;
            }
        };

        let response = self.handle_request(&data)?;
        let response_id = StandardId::new(self.response_cob_id)?;
        CanFrame::new(response_id, response.as_bytes())
    }

    /// Process one request body and produce the response body, if any.
    pub fn handle_request(&mut self, data: &[u8; 8]) -> Option<SdoFrame> {
        let request = frame::decode(data);
        debug!("<- {:02X?}", data);

        let response = match request.command >> 5 {
            CCS_INITIATE_DOWNLOAD => self.initiate_download(&request),
            CCS_DOWNLOAD_SEGMENT => self.download_segment(&request),
            CCS_INITIATE_UPLOAD => self.initiate_upload(&request),
            CCS_UPLOAD_SEGMENT => self.upload_segment(&request),
            CCS_ABORT => {
                let code = request.abort.map_or(0, |info| info.code);
                warn!(
                    "Client aborted 0x{:04X}:{:02X}: 0x{:08X} {}",
                    request.index,
                    request.sub_index,
                    code,
                    abort::lookup(code)
                );
                self.session = Session::Idle;
                return None;
            }
            _ => Err(abort::COMMAND_SPECIFIER_INVALID),
        };

        match response {
            Ok(frame) => Some(frame),
            Err(code) => Some(self.abort(code, &request)),
        }
    }

    fn abort(&mut self, code: u32, request: &Indication) -> SdoFrame {
        // Segment frames carry no multiplexer; report the session's
        let (index, sub_index) = match &self.session {
            Session::Download { index, sub_index, .. } | Session::Upload { index, sub_index, .. } => {
                (*index, *sub_index)
            }
            Session::Idle => (request.index, request.sub_index),
        };
        warn!(
            "Aborting 0x{:04X}:{:02X}: 0x{:08X} {}",
            index,
            sub_index,
            code,
            abort::lookup(code)
        );
        self.session = Session::Idle;
        frame::encode_abort(index, sub_index, code)
    }

    fn initiate_download(&mut self, request: &Indication) -> Result<SdoFrame, u32> {
        let (index, sub_index) = (request.index, request.sub_index);
        self.session = Session::Idle;
        self.object_dict.check_writable(index, sub_index)?;

        if request.is_expedited() {
            let payload = request.expedited_payload().to_vec();
            info!("SDO download 0x{:04X}:{:02X} = {:02X?}", index, sub_index, payload);
            self.object_dict.write(index, sub_index, payload)?;
        } else {
            let expected = request.is_size_indicated().then(|| request.size() as usize);
            debug!("SDO segmented download 0x{:04X}:{:02X} size={:?}", index, sub_index, expected);

            if expected == Some(0) {
                self.object_dict.write(index, sub_index, Vec::new())?;
            } else {
                self.session = Session::Download {
                    index,
                    sub_index,
                    expected,
                    toggle: None,
                    buffer: Vec::new(),
                };
            }
        }

        Ok(SdoFrame::new(frame::INITIATE_DOWNLOAD_RESPONSE, index, sub_index))
    }

    fn download_segment(&mut self, request: &Indication) -> Result<SdoFrame, u32> {
        let Session::Download { index, sub_index, expected, toggle, buffer } = &mut self.session else {
            return Err(abort::COMMAND_SPECIFIER_INVALID);
        };
        // Any first download toggle is accepted, then it must alternate
        if toggle.is_some_and(|previous| previous == request.toggle()) {
            return Err(abort::TOGGLE_BIT_NOT_ALTERED);
        }
        *toggle = Some(request.toggle());

        buffer.extend_from_slice(request.segment_payload());
        if expected.is_some_and(|expected| buffer.len() > expected) {
            return Err(abort::LENGTH_TOO_HIGH);
        }

        let ack = SdoFrame::from_bytes([frame::DOWNLOAD_SEGMENT_RESPONSE | (request.toggle() << 4), 0, 0, 0, 0, 0, 0, 0]);
        if !request.is_last_segment() {
            return Ok(ack);
        }

        if expected.is_some_and(|expected| buffer.len() != expected) {
            return Err(abort::LENGTH_MISMATCH);
        }
        let (index, sub_index, data) = (*index, *sub_index, std::mem::take(buffer));
        let value = format_data(&data, self.object_dict.check_writable(index, sub_index)?);
        self.object_dict.write(index, sub_index, data)?;
        self.session = Session::Idle;
        info!("SDO download 0x{:04X}:{:02X} = {}", index, sub_index, value);
        Ok(ack)
    }

    fn initiate_upload(&mut self, request: &Indication) -> Result<SdoFrame, u32> {
        let (index, sub_index) = (request.index, request.sub_index);
        self.session = Session::Idle;
        let (data, data_type) = self.object_dict.read(index, sub_index)?;
        info!(
            "SDO upload 0x{:04X}:{:02X} = {} (type={:?})",
            index,
            sub_index,
            format_data(&data, data_type),
            data_type
        );

        if !data.is_empty() && data.len() <= EXPEDITED_MAX {
            // e and s set, n = unused bytes
            let command = 0x43 | (((EXPEDITED_MAX - data.len()) as u8) << 2);
            let mut bytes = *SdoFrame::new(command, index, sub_index).as_bytes();
            bytes[4..4 + data.len()].copy_from_slice(&data);
            return Ok(SdoFrame::from_bytes(bytes));
        }

        let mut bytes = *SdoFrame::new(0x41, index, sub_index).as_bytes();
        bytes[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
        self.session = Session::Upload {
            index,
            sub_index,
            data,
            offset: 0,
            toggle: FIRST_UPLOAD_SEGMENT_TOGGLE,
        };
        Ok(SdoFrame::from_bytes(bytes))
    }

    fn upload_segment(&mut self, request: &Indication) -> Result<SdoFrame, u32> {
        let Session::Upload { data, offset, toggle, .. } = &mut self.session else {
            return Err(abort::COMMAND_SPECIFIER_INVALID);
        };
        if request.toggle() != *toggle {
            return Err(abort::TOGGLE_BIT_NOT_ALTERED);
        }
        *toggle ^= 1;

        let count = SEGMENT_MAX.min(data.len() - *offset);
        let last = *offset + count == data.len();

        let mut bytes = [0u8; 8];
        bytes[0] = (request.toggle() << 4) | (((SEGMENT_MAX - count) as u8) << 1) | last as u8;
        bytes[1..1 + count].copy_from_slice(&data[*offset..*offset + count]);
        *offset += count;

        if last {
            self.session = Session::Idle;
        }
        Ok(SdoFrame::from_bytes(bytes))
    }
}

/// Format data for display based on its type
fn format_data(data: &[u8], data_type: DataType) -> String {
    match data_type.decode(data) {
        Ok(value) => value.to_string(),
        Err(_) => format!("{:02X?}", data),
    }
}
