//! Object Dictionary for the mock CANopen node
//!
//! Simulated objects served over SDO. Static entries hold bytes and may be
//! writable; dynamic entries are regenerated on every read and reject writes.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};

use canopen_sdo::abort;
use canopen_sdo::DataType;
use log::info;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

/// Represents a single entry in the object dictionary
pub enum ObjectEntry {
    /// Stored value, replaced by SDO downloads when writable
    Static {
        data: Vec<u8>,
        data_type: DataType,
        access: Access,
    },
    /// Value generated on each read
    Dynamic(Box<dyn Fn() -> Vec<u8> + Send + Sync>, DataType),
}

impl ObjectEntry {
    fn data_type(&self) -> DataType {
        match self {
            ObjectEntry::Static { data_type, .. } | ObjectEntry::Dynamic(_, data_type) => *data_type,
        }
    }
}

/// Object dictionary mapping (index, subindex) to values.
/// Failed accesses report the SDO abort code to answer with.
#[derive(Default)]
pub struct ObjectDictionary {
    entries: BTreeMap<(u16, u8), ObjectEntry>,
}

impl ObjectDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_static(&mut self, index: u16, sub_index: u8, data: Vec<u8>, data_type: DataType, access: Access) {
        self.entries.insert(
            (index, sub_index),
            ObjectEntry::Static { data, data_type, access },
        );
    }

    pub fn add_dynamic<F>(&mut self, index: u16, sub_index: u8, generator: F, data_type: DataType)
    where
        F: Fn() -> Vec<u8> + Send + Sync + 'static,
    {
        self.entries.insert(
            (index, sub_index),
            ObjectEntry::Dynamic(Box::new(generator), data_type),
        );
    }

    /// Current bytes of an entry.
    pub fn read(&self, index: u16, sub_index: u8) -> Result<(Vec<u8>, DataType), u32> {
        match self.lookup(index, sub_index)? {
            ObjectEntry::Static { data, data_type, .. } => Ok((data.clone(), *data_type)),
            ObjectEntry::Dynamic(generator, data_type) => Ok((generator(), *data_type)),
        }
    }

    /// Check that a download to the entry may start.
    pub fn check_writable(&self, index: u16, sub_index: u8) -> Result<DataType, u32> {
        match self.lookup(index, sub_index)? {
            ObjectEntry::Static { data_type, access: Access::ReadWrite, .. } => Ok(*data_type),
            _ => Err(abort::WRITE_READ_ONLY),
        }
    }

    /// Replace the bytes of a writable entry. Fixed width types must be
    /// written in full.
    pub fn write(&mut self, index: u16, sub_index: u8, bytes: Vec<u8>) -> Result<(), u32> {
        let data_type = self.check_writable(index, sub_index)?;
        if data_type.fixed_size().is_some_and(|width| width != bytes.len()) {
            return Err(abort::LENGTH_MISMATCH);
        }

        if let Some(ObjectEntry::Static { data, .. }) = self.entries.get_mut(&(index, sub_index)) {
            *data = bytes;
        }
        Ok(())
    }

    fn lookup(&self, index: u16, sub_index: u8) -> Result<&ObjectEntry, u32> {
        if let Some(entry) = self.entries.get(&(index, sub_index)) {
            return Ok(entry);
        }
        if self.entries.keys().any(|(i, _)| *i == index) {
            Err(abort::SUBINDEX_DOES_NOT_EXIST)
        } else {
            Err(abort::OBJECT_DOES_NOT_EXIST)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Log one line per object
    pub fn log_summary(&self) {
        for ((index, sub_index), entry) in &self.entries {
            let kind = match entry {
                ObjectEntry::Static { access: Access::ReadWrite, .. } => "rw",
                ObjectEntry::Static { access: Access::ReadOnly, .. } => "ro",
                ObjectEntry::Dynamic(..) => "dynamic",
            };
            info!("  0x{:04X}:{:02X} - {:?} ({})", index, sub_index, entry.data_type(), kind);
        }
    }

    /// Populate the standard test objects for `node_id`
    pub fn add_test_objects(&mut self, node_id: u8) {
        // Identity
        self.add_static(0x1000, 0x00, 0x0000_0191u32.to_le_bytes().to_vec(), DataType::UInt32, Access::ReadOnly);
        self.add_static(0x1001, 0x00, vec![0x00], DataType::UInt8, Access::ReadOnly);
        self.add_static(0x1008, 0x00, b"MockCANopenNode".to_vec(), DataType::VisibleString, Access::ReadOnly);
        self.add_static(0x1018, 0x01, 0x0000_0001u32.to_le_bytes().to_vec(), DataType::UInt32, Access::ReadOnly);
        self.add_static(0x1018, 0x02, (0x0100 + node_id as u32).to_le_bytes().to_vec(), DataType::UInt32, Access::ReadOnly);

        // Sensors, regenerated on each read
        self.add_dynamic(0x2000, 0x01, || random_real(20.0..30.0), DataType::Real32); // temperature
        self.add_dynamic(0x2000, 0x02, || random_real(95.0..105.0), DataType::Real32); // pressure

        let counter = AtomicU32::new(0);
        self.add_dynamic(
            0x2001,
            0x01,
            move || counter.fetch_add(1, Ordering::SeqCst).to_le_bytes().to_vec(),
            DataType::UInt32,
        );

        self.add_dynamic(0x2002, 0x01, || random_real(11.5..12.5), DataType::Real32); // voltage
        self.add_dynamic(0x2002, 0x02, || random_real(0.5..5.0), DataType::Real32); // current

        // Status and control
        self.add_static(0x2003, 0x01, 0x0031u16.to_le_bytes().to_vec(), DataType::UInt16, Access::ReadOnly);
        self.add_static(0x2003, 0x02, 0x000Fu16.to_le_bytes().to_vec(), DataType::UInt16, Access::ReadWrite);

        self.add_dynamic(
            0x2004,
            0x01,
            || rand::rng().random_range(1000i32..3000).to_le_bytes().to_vec(),
            DataType::Int32,
        );

        let position = AtomicU32::new(0);
        self.add_dynamic(
            0x2005,
            0x01,
            move || (position.fetch_add(10, Ordering::SeqCst) as i32).to_le_bytes().to_vec(),
            DataType::Int32,
        );

        // Writable parameters, long enough for segmented transfers
        self.add_static(0x2006, 0x00, b"unnamed".to_vec(), DataType::VisibleString, Access::ReadWrite);
        self.add_static(0x2007, 0x00, Vec::new(), DataType::OctetString, Access::ReadWrite);
        self.add_static(0x2008, 0x00, 0i32.to_le_bytes().to_vec(), DataType::Int32, Access::ReadWrite);
    }
}

fn random_real(range: std::ops::Range<f32>) -> Vec<u8> {
    rand::rng().random_range(range).to_le_bytes().to_vec()
}
