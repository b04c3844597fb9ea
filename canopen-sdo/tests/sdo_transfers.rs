//! End-to-end transfers between the client and a simulated SDO server.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use canopen_sdo::{
    DataType, Dictionary, Dispatcher, Entry, Protocol, ReferenceError, SdoClient, SdoError,
    SdoFrame, Target, Transport, Value,
};

const NODE_ID: u8 = 4;

#[derive(Default)]
enum Session {
    #[default]
    Idle,
    Download {
        index: u16,
        sub_index: u8,
        expected: usize,
        buffer: Vec<u8>,
    },
    Upload {
        data: Vec<u8>,
        offset: usize,
        toggle: u8,
    },
}

#[derive(Default)]
struct ServerState {
    memory: HashMap<(u16, u8), Vec<u8>>,
    read_only: HashSet<(u16, u8)>,
    session: Session,
    requests: Vec<SdoFrame>,
}

/// In-memory SDO server answering on the dispatcher as node `NODE_ID`.
struct SimulatedNode {
    dispatcher: Dispatcher,
    state: Mutex<ServerState>,
}

impl SimulatedNode {
    fn new(dispatcher: &Dispatcher) -> Arc<Self> {
        Arc::new(Self {
            dispatcher: dispatcher.clone(),
            state: Mutex::new(ServerState::default()),
        })
    }

    fn store(&self, index: u16, sub_index: u8, data: &[u8]) {
        self.state.lock().unwrap().memory.insert((index, sub_index), data.to_vec());
    }

    fn protect(&self, index: u16, sub_index: u8) {
        self.state.lock().unwrap().read_only.insert((index, sub_index));
    }

    fn memory(&self, index: u16, sub_index: u8) -> Option<Vec<u8>> {
        self.state.lock().unwrap().memory.get(&(index, sub_index)).cloned()
    }

    fn requests(&self) -> Vec<SdoFrame> {
        self.state.lock().unwrap().requests.clone()
    }

    fn handle(state: &mut ServerState, request: &[u8; 8]) -> Option<[u8; 8]> {
        let command = request[0];
        let index = u16::from_le_bytes([request[1], request[2]]);
        let sub_index = request[3];
        let mux = [request[1], request[2], request[3]];
        let abort = |code: u32| {
            let mut response = [0x80, mux[0], mux[1], mux[2], 0, 0, 0, 0];
            response[4..8].copy_from_slice(&code.to_le_bytes());
            response
        };

        match command >> 5 {
            // initiate download
            1 => {
                if !state.memory.contains_key(&(index, sub_index)) {
                    return Some(abort(0x0602_0000));
                }
                if state.read_only.contains(&(index, sub_index)) {
                    return Some(abort(0x0601_0002));
                }
                if command & 0x02 != 0 {
                    let len = 4 - ((command >> 2) & 0x03) as usize;
                    state.memory.insert((index, sub_index), request[4..4 + len].to_vec());
                } else {
                    let expected = u32::from_le_bytes([request[4], request[5], request[6], request[7]]);
                    state.session = Session::Download {
                        index,
                        sub_index,
                        expected: expected as usize,
                        buffer: Vec::new(),
                    };
                }
                Some([0x60, mux[0], mux[1], mux[2], 0, 0, 0, 0])
            }
            // download segment
            0 => {
                let Session::Download { index, sub_index, expected, buffer } = &mut state.session else {
                    return Some(abort(0x0504_0001));
                };
                let toggle = (command >> 4) & 1;
                let unused = ((command >> 1) & 0x07) as usize;
                buffer.extend_from_slice(&request[1..8 - unused]);

                if command & 1 != 0 {
                    let key = (*index, *sub_index);
                    let complete = buffer.len() == *expected;
                    let data = std::mem::take(buffer);
                    state.session = Session::Idle;
                    if !complete {
                        return Some(abort(0x0607_0010));
                    }
                    state.memory.insert(key, data);
                }
                Some([0x20 | (toggle << 4), 0, 0, 0, 0, 0, 0, 0])
            }
            // initiate upload
            2 => {
                let Some(data) = state.memory.get(&(index, sub_index)).cloned() else {
                    return Some(abort(0x0602_0000));
                };
                let mut response = [0u8; 8];
                response[1..4].copy_from_slice(&mux);
                if data.len() <= 4 {
                    response[0] = 0x43 | (((4 - data.len()) as u8) << 2);
                    response[4..4 + data.len()].copy_from_slice(&data);
                } else {
                    response[0] = 0x41;
                    response[4..8].copy_from_slice(&(data.len() as u32).to_le_bytes());
                    state.session = Session::Upload { data, offset: 0, toggle: 0 };
                }
                Some(response)
            }
            // upload segment
            3 => {
                let Session::Upload { data, offset, toggle: expected } = &mut state.session else {
                    return Some(abort(0x0504_0001));
                };
                let toggle = (command >> 4) & 1;
                if toggle != *expected {
                    state.session = Session::Idle;
                    return Some(abort(0x0503_0000));
                }
                *expected ^= 1;
                let count = 7.min(data.len() - *offset);
                let last = *offset + count == data.len();

                let mut response = [0u8; 8];
                response[0] = (toggle << 4) | (((7 - count) as u8) << 1) | last as u8;
                response[1..1 + count].copy_from_slice(&data[*offset..*offset + count]);
                *offset += count;
                if last {
                    state.session = Session::Idle;
                }
                Some(response)
            }
            // abort from the client
            4 => {
                state.session = Session::Idle;
                None
            }
            _ => Some(abort(0x0504_0001)),
        }
    }
}

impl Transport for SimulatedNode {
    fn send(&self, cob_id: u16, frame: &SdoFrame) -> io::Result<()> {
        assert_eq!(cob_id, 0x600 + NODE_ID as u16);
        let response = {
            let mut state = self.state.lock().unwrap();
            state.requests.push(*frame);
            Self::handle(&mut state, frame.as_bytes())
        };
        if let Some(response) = response {
            self.dispatcher.publish(0x580 + NODE_ID as u16, &response);
        }
        Ok(())
    }
}

fn setup() -> (Arc<SimulatedNode>, SdoClient, Dispatcher, Dictionary) {
    let _ = env_logger::try_init();

    let dispatcher = Dispatcher::new();
    let node = SimulatedNode::new(&dispatcher);
    node.store(0x1000, 0x00, &0x0000_0191u32.to_le_bytes());
    node.store(0x1008, 0x00, b"MockCANopenNode");
    node.store(0x2001, 0x01, &[0, 0, 0, 0]);
    node.store(0x2100, 0x00, &[]);
    node.protect(0x1000, 0x00);
    node.protect(0x1008, 0x00);

    let client = SdoClient::new(NODE_ID, node.clone(), dispatcher.clone());

    let mut dictionary = Dictionary::new();
    dictionary.add_entry(Entry::new(0x1000, 0x00, "Device type", DataType::UInt32));
    dictionary.add_entry(Entry::new(0x1008, 0x00, "Manufacturer device name", DataType::VisibleString));
    dictionary.add_entry(Entry::new(0x2001, 0x01, "Counter", DataType::UInt32));
    dictionary.add_entry(Entry::new(0x2100, 0x00, "Blob", DataType::OctetString));
    dictionary.add_entry(Entry::new(0x2200, 0x00, "Setpoint", DataType::Int16));
    dictionary.add_entry(Entry::new(0x2201, 0x00, "Setpoint", DataType::Int16));

    (node, client, dispatcher, dictionary)
}

#[tokio::test]
async fn expedited_download_sends_one_frame_and_updates_entry() {
    let (node, client, dispatcher, mut dictionary) = setup();

    let entry = client
        .download(&mut dictionary, &Target::from("Counter"), 0x01, &Value::Unsigned(42), None)
        .await
        .unwrap();

    assert_eq!(entry.value, Some(Value::Unsigned(42)));
    assert_eq!(entry.size, 4);
    assert_eq!(node.memory(0x2001, 0x01), Some(vec![42, 0, 0, 0]));

    let requests = node.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].as_bytes(), &[0x23, 0x01, 0x20, 0x01, 42, 0, 0, 0]);
    assert_eq!(dispatcher.listener_count(Protocol::Sdo), 0);
}

#[tokio::test]
async fn segmented_download_of_twenty_bytes() {
    let (node, client, _, mut dictionary) = setup();
    let payload: Vec<u8> = (1..=20).collect();

    let entry = client
        .download(&mut dictionary, &Target::Index(0x2100), 0x00, &Value::Bytes(payload.clone()), None)
        .await
        .unwrap();
    assert_eq!(entry.size, 20);
    assert_eq!(node.memory(0x2100, 0x00), Some(payload.clone()));

    let requests = node.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[0].as_bytes(), &[0x21, 0x00, 0x21, 0x00, 20, 0, 0, 0]);

    let segments = &requests[1..];
    let counts: Vec<usize> = segments
        .iter()
        .map(|s| 7 - ((s.command() >> 1) & 0x07) as usize)
        .collect();
    let toggles: Vec<u8> = segments.iter().map(|s| (s.command() >> 4) & 1).collect();
    assert_eq!(counts, vec![7, 7, 6]);
    assert_eq!(toggles, vec![1, 0, 1]);
    assert_eq!(segments[2].command() & 1, 1);
    assert!(segments[..2].iter().all(|s| s.command() & 1 == 0));
}

#[tokio::test]
async fn segmented_upload_of_a_string() {
    let (node, client, _, mut dictionary) = setup();

    let entry = client
        .upload(&mut dictionary, &Target::Index(0x1008), 0x00, None)
        .await
        .unwrap();
    assert_eq!(entry.value, Some(Value::Text("MockCANopenNode".into())));
    assert_eq!(entry.size, 15);

    // initiate + 3 segment requests (7 + 7 + 1 bytes)
    let requests = node.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[0].command(), 0x40);
    let toggles: Vec<u8> = requests[1..].iter().map(|r| r.command()).collect();
    assert_eq!(toggles, vec![0x60, 0x70, 0x60]);
}

#[tokio::test]
async fn expedited_upload() {
    let (_, client, _, mut dictionary) = setup();

    let entry = client
        .upload(&mut dictionary, &Target::from("device type"), 0x00, None)
        .await
        .unwrap();
    assert_eq!(entry.value, Some(Value::Unsigned(0x191)));
    assert_eq!(dictionary.entry(0x1000, 0).unwrap().raw, vec![0x91, 0x01, 0x00, 0x00]);
}

#[tokio::test]
async fn oversized_value_for_fixed_width_entry_fails() {
    let (node, client, _, mut dictionary) = setup();
    node.store(0x2001, 0x01, &[1, 2, 3, 4, 5, 6, 7, 8]);

    let result = client
        .upload(&mut dictionary, &Target::from("Counter"), 0x01, None)
        .await;
    assert!(matches!(result, Err(SdoError::Value(_))));
    assert_eq!(dictionary.entry(0x2001, 0x01).unwrap().value, None);

    // the transfer itself completed: initiate + 2 segment requests
    assert_eq!(node.requests().len(), 3);
    assert!(!client.is_busy());
}

#[tokio::test]
async fn write_then_read_back() {
    let (_, client, _, mut dictionary) = setup();
    let blob = Value::Bytes(b"a somewhat longer octet string".to_vec());

    client
        .download(&mut dictionary, &Target::Index(0x2100), 0, &blob, None)
        .await
        .unwrap();
    let entry = client
        .upload(&mut dictionary, &Target::Index(0x2100), 0, None)
        .await
        .unwrap();
    assert_eq!(entry.value, Some(blob));
}

#[tokio::test]
async fn remote_abort_leaves_entry_untouched() {
    let (node, client, dispatcher, mut dictionary) = setup();

    let result = client
        .download(&mut dictionary, &Target::Index(0x1000), 0, &Value::Unsigned(1), None)
        .await;
    match result {
        Err(SdoError::ProtocolAbort { code, reason }) => {
            assert_eq!(code, 0x0601_0002);
            assert_eq!(reason, "Attempt to write a read only object");
        }
        other => panic!("unexpected {:?}", other),
    }

    assert_eq!(dictionary.entry(0x1000, 0).unwrap().value, None);
    assert_eq!(node.memory(0x1000, 0), Some(0x0000_0191u32.to_le_bytes().to_vec()));
    assert_eq!(dispatcher.listener_count(Protocol::Sdo), 0);
    assert!(!client.is_busy());
}

#[tokio::test]
async fn missing_object_on_the_node_aborts() {
    let (_, client, _, _) = setup();

    let result = client.upload_raw(0x3000, 0, None).await;
    assert!(matches!(
        result,
        Err(SdoError::ProtocolAbort { code: 0x0602_0000, reason: "Object does not exist" })
    ));
}

#[tokio::test]
async fn ambiguous_name_fails_without_sending() {
    let (node, client, _, mut dictionary) = setup();

    let result = client
        .download(&mut dictionary, &Target::from("Setpoint"), 0, &Value::Signed(-5), None)
        .await;
    assert!(matches!(
        result,
        Err(SdoError::Reference(ReferenceError::Ambiguous { count: 2, .. }))
    ));
    assert!(node.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_times_out() {
    let _ = env_logger::try_init();
    let dispatcher = Dispatcher::new();
    let silent = Arc::new(Silent::default());
    let client = SdoClient::new(6, silent.clone(), dispatcher.clone())
        .with_timeout(Duration::from_millis(500));

    let started = tokio::time::Instant::now();
    let result = client.upload_raw(0x1000, 0, None).await;

    assert!(matches!(result, Err(SdoError::Timeout { index: 0x1000, sub_index: 0 })));
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(dispatcher.listener_count(Protocol::Sdo), 0);
    assert_eq!(*silent.sent.lock().unwrap(), vec![0x40, 0x80]);
}

#[derive(Default)]
struct Silent {
    sent: Mutex<Vec<u8>>,
}

impl Transport for Silent {
    fn send(&self, _cob_id: u16, frame: &SdoFrame) -> io::Result<()> {
        self.sent.lock().unwrap().push(frame.command());
        Ok(())
    }
}
