//! Object dictionary seen from the client: what can be addressed on the
//! remote node, with the last value transferred for every entry.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;

use configparser::ini::Ini;
use log::warn;

use crate::error::{DictionaryError, ReferenceError};
use crate::value::{DataType, EncodedValue, Value};

/// One addressable `(index, sub_index)` parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub index: u16,
    pub sub_index: u8,
    pub name: String,
    pub data_type: DataType,
    /// Last known value, `None` until transferred or defaulted.
    pub value: Option<Value>,
    pub size: usize,
    pub raw: Vec<u8>,
}

impl Entry {
    pub fn new(index: u16, sub_index: u8, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            index,
            sub_index,
            name: name.into(),
            data_type,
            value: None,
            size: data_type.fixed_size().unwrap_or(0),
            raw: Vec::new(),
        }
    }

    /// Record a transferred value.
    pub fn store(&mut self, encoded: EncodedValue) {
        self.value = Some(encoded.value);
        self.size = encoded.size;
        self.raw = encoded.raw;
    }
}

/// An object at one index, holding its sub-entries sorted by sub-index.
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    pub index: u16,
    pub name: String,
    pub entries: BTreeMap<u8, Entry>,
}

impl Object {
    pub fn new(index: u16, name: impl Into<String>) -> Self {
        Self {
            index,
            name: name.into(),
            entries: BTreeMap::new(),
        }
    }

    pub fn entry(&self, sub_index: u8) -> Option<&Entry> {
        self.entries.get(&sub_index)
    }

    pub fn entry_mut(&mut self, sub_index: u8) -> Option<&mut Entry> {
        self.entries.get_mut(&sub_index)
    }
}

/// How an operation names the object it addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Index(u16),
    Name(String),
}

impl Target {
    /// `0x2000` or `8192` address an index, anything else is a name.
    pub fn parse(text: &str) -> Self {
        let text = text.trim();
        let index = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
            Some(hex) => u16::from_str_radix(hex, 16).ok(),
            None => text.parse::<u16>().ok(),
        };
        match index {
            Some(index) => Self::Index(index),
            None => Self::Name(text.to_string()),
        }
    }
}

impl From<u16> for Target {
    fn from(index: u16) -> Self {
        Self::Index(index)
    }
}

impl From<&str> for Target {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(index) => write!(f, "0x{:04X}", index),
            Self::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Outcome of resolving a [`Target`].
#[derive(Debug)]
pub enum Resolution<'a> {
    Found(&'a mut Object),
    NotFound,
    /// The name matches this many objects.
    Ambiguous(usize),
}

/// Store the client resolves targets against.
pub trait ObjectDictionary {
    fn resolve(&mut self, target: &Target) -> Resolution<'_>;

    /// Resolve `target` and select `sub_index` on the found object.
    fn lookup(&mut self, target: &Target, sub_index: u8) -> Result<&mut Entry, ReferenceError> {
        match self.resolve(target) {
            Resolution::Found(object) => {
                let index = object.index;
                object
                    .entry_mut(sub_index)
                    .ok_or(ReferenceError::NoSuchSubindex { index, sub_index })
            }
            Resolution::NotFound => Err(ReferenceError::NotFound(target.to_string())),
            Resolution::Ambiguous(count) => Err(ReferenceError::Ambiguous {
                target: target.to_string(),
                count,
            }),
        }
    }
}

/// In-memory object dictionary, usually loaded from the node's EDS file.
#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    objects: BTreeMap<u16, Object>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a single entry, creating its object if needed.
    pub fn add_entry(&mut self, entry: Entry) {
        let object = self
            .objects
            .entry(entry.index)
            .or_insert_with(|| Object::new(entry.index, entry.name.clone()));
        object.entries.insert(entry.sub_index, entry);
    }

    pub fn get(&self, index: u16) -> Option<&Object> {
        self.objects.get(&index)
    }

    pub fn entry(&self, index: u16, sub_index: u8) -> Option<&Entry> {
        self.objects.get(&index)?.entry(sub_index)
    }

    pub fn objects(&self) -> impl Iterator<Item = &Object> {
        self.objects.values()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Load an EDS file from disk.
    pub fn from_eds_file(path: impl AsRef<Path>) -> Result<Self, DictionaryError> {
        let mut config = Ini::new();
        let map = config.load(path.as_ref()).map_err(DictionaryError::Parse)?;
        Self::from_sections(&map)
    }

    /// Load an EDS document held in memory.
    pub fn from_eds_str(text: &str) -> Result<Self, DictionaryError> {
        let mut config = Ini::new();
        let map = config.read(text.to_string()).map_err(DictionaryError::Parse)?;
        Self::from_sections(&map)
    }

    fn from_sections(
        map: &HashMap<String, HashMap<String, Option<String>>>,
    ) -> Result<Self, DictionaryError> {
        let mut dictionary = Self::new();

        // Section names are lowercased by the parser: "1018", "1018sub1"
        for (section, properties) in map {
            let (index_str, sub_str) = match section.split_once("sub") {
                Some((index_str, sub_str)) => (index_str, Some(sub_str)),
                None => (section.as_str(), None),
            };
            let Ok(index) = u16::from_str_radix(index_str, 16) else {
                continue; // FileInfo, DeviceInfo, MandatoryObjects, ...
            };

            let get = |key: &str| property(properties, key);
            let name = get("parametername").unwrap_or("Unnamed Object");

            let sub_index = match sub_str {
                Some(sub_str) => u8::from_str_radix(sub_str, 16).map_err(|_| {
                    DictionaryError::InvalidEntry {
                        section: section.clone(),
                        message: format!("bad sub index '{}'", sub_str),
                    }
                })?,
                None => {
                    let object = dictionary.objects.entry(index).or_insert_with(|| Object::new(index, name));
                    object.name = name.to_string();

                    // Records and arrays only describe their sub sections
                    let is_var = get("objecttype")
                        .map(|t| matches!(t.trim(), "0x7" | "0x07" | "7"))
                        .unwrap_or(true);
                    if !is_var || get("datatype").is_none() {
                        continue;
                    }
                    0
                }
            };

            let Some(data_type) = get("datatype").and_then(DataType::from_eds_type) else {
                warn!("[{}] has an unsupported data type, skipped", section);
                continue;
            };

            let mut entry = Entry::new(index, sub_index, name, data_type);
            if let Some(default) = get("defaultvalue").filter(|v| !v.trim().is_empty()) {
                // $NODEID expressions and the like are left unset
                if let Ok(encoded) = data_type.parse(default).and_then(|v| data_type.encode(&v)) {
                    entry.store(encoded);
                }
            }

            let parent_name = map
                .get(index_str)
                .and_then(|props| property(props, "parametername"))
                .unwrap_or(name);
            dictionary
                .objects
                .entry(index)
                .or_insert_with(|| Object::new(index, parent_name))
                .entries
                .insert(sub_index, entry);
        }

        Ok(dictionary)
    }
}

fn property<'a>(properties: &'a HashMap<String, Option<String>>, key: &str) -> Option<&'a str> {
    properties.get(key).and_then(|v| v.as_deref())
}

impl ObjectDictionary for Dictionary {
    fn resolve(&mut self, target: &Target) -> Resolution<'_> {
        match target {
            Target::Index(index) => match self.objects.get_mut(index) {
                Some(object) => Resolution::Found(object),
                None => Resolution::NotFound,
            },
            Target::Name(name) => {
                let mut matches = self
                    .objects
                    .values_mut()
                    .filter(|object| object.name.eq_ignore_ascii_case(name));
                match (matches.next(), matches.count()) {
                    (None, _) => Resolution::NotFound,
                    (Some(object), 0) => Resolution::Found(object),
                    (Some(_), others) => Resolution::Ambiguous(others + 1),
                }
            }
        }
    }
}
