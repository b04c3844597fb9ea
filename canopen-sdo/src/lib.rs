//! # CANopen SDO Client
//!
//! Client side of the CANopen Service Data Object protocol, used by the
//! `sdo` command line tool and by the mock CANopen node for testing.
//!
//! This library provides:
//! - SDO abort codes and their reasons
//! - SDO frame encoding/decoding
//! - The expedited/segmented transfer state machine
//! - An async client bound to one node, with timeouts and abort handling
//! - Object dictionary resolution (EDS files) and typed value encoding
//! - A SocketCAN transport and a protocol-keyed frame dispatcher

pub mod abort;
pub mod can;
pub mod client;
pub mod dictionary;
pub mod error;
pub mod frame;
pub mod transfer;
pub mod transport;
pub mod value;

// Re-export commonly used types for convenience
pub use can::CanBus;
pub use client::{ClientConfig, SdoClient, DEFAULT_TIMEOUT};
pub use dictionary::{Dictionary, Entry, Object, ObjectDictionary, Resolution, Target};
pub use error::{DictionaryError, ReferenceError, SdoError};
pub use frame::{decode, Indication, SdoFrame};
pub use transfer::{Direction, Mode, State, Step, Transfer};
pub use transport::{Dispatcher, InboundFrame, Listener, Protocol, Transport};
pub use value::{DataType, EncodedValue, Value};
