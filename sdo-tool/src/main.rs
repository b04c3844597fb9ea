//! # sdo
//!
//! Command line SDO client: reads and writes object dictionary entries of a
//! CANopen node over SocketCAN.
//!
//! ```bash
//! sdo --interface vcan0 --node-id 4 --eds mock.eds read "Device type"
//! sdo --node-id 4 --eds mock.eds write 0x2006 0 "conveyor 1"
//! sdo --node-id 4 read 0x1008            # raw bytes without an EDS
//! sdo --node-id 4 save-config            # remember interface and node
//! ```

mod config;

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use canopen_sdo::{CanBus, DataType, Dictionary, Dispatcher, ObjectDictionary, SdoClient, Target, Value};
use clap::{Parser, Subcommand};
use log::{debug, info};

use config::AppConfig;

#[derive(Parser, Debug)]
#[command(name = "sdo", version, about = "Read and write CANopen object dictionary entries over SDO")]
struct Cli {
    /// SocketCAN interface, e.g. vcan0
    #[arg(short, long)]
    interface: Option<String>,

    /// Node ID of the remote node (1-127)
    #[arg(short, long, value_parser = clap::value_parser!(u8).range(1..=127))]
    node_id: Option<u8>,

    /// EDS file describing the node's object dictionary
    #[arg(short, long)]
    eds: Option<PathBuf>,

    /// Per-operation timeout in milliseconds
    #[arg(short, long)]
    timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload an entry from the node
    Read {
        /// Object index (0x1008) or parameter name
        target: String,
        #[arg(default_value = "0", value_parser = parse_sub_index)]
        sub_index: u8,
    },
    /// Download a value to the node
    Write {
        /// Object index (0x2006) or parameter name
        target: String,
        #[arg(value_parser = parse_sub_index)]
        sub_index: u8,
        /// Value in the entry's type; hex bytes when no EDS is loaded
        value: String,
    },
    /// List the objects of the EDS file
    List,
    /// Store the effective interface, node, EDS and timeout as defaults
    SaveConfig,
}

fn parse_sub_index(text: &str) -> Result<u8, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => text.parse::<u8>(),
    };
    parsed.map_err(|e| format!("invalid sub-index {:?}: {}", text, e))
}

impl Cli {
    /// Command line flags override the stored configuration.
    fn merge(&self, mut config: AppConfig) -> AppConfig {
        if let Some(interface) = &self.interface {
            config.can_interface = interface.clone();
        }
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(eds) = &self.eds {
            config.eds_file_path = Some(eds.display().to_string());
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        config
    }
}

fn load_dictionary(config: &AppConfig) -> Result<Option<Dictionary>, Box<dyn Error>> {
    let Some(path) = &config.eds_file_path else {
        return Ok(None);
    };
    let dictionary = Dictionary::from_eds_file(path)?;
    info!("Loaded {} objects from {}", dictionary.len(), path);
    Ok(Some(dictionary))
}

fn print_objects(dictionary: &Dictionary) {
    for object in dictionary.objects() {
        println!("0x{:04X} {}", object.index, object.name);
        for entry in object.entries.values() {
            let value = entry
                .value
                .as_ref()
                .map_or_else(String::new, |value| format!(" = {}", value));
            println!("  {:02X} {:<32} {:?}{}", entry.sub_index, entry.name, entry.data_type, value);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();
    let config = cli.merge(AppConfig::load());
    debug!("Effective configuration: {:?}", config);

    match &cli.command {
        Command::SaveConfig => {
            let path = config.save()?;
            println!("Saved configuration to {}", path.display());
            return Ok(());
        }
        Command::List => {
            let dictionary = load_dictionary(&config)?.ok_or("list needs an EDS file (--eds)")?;
            print_objects(&dictionary);
            return Ok(());
        }
        Command::Read { .. } | Command::Write { .. } => {}
    }

    let dictionary = load_dictionary(&config)?;

    let bus = CanBus::open(&config.can_interface)?;
    let dispatcher = Dispatcher::new();
    let reader = bus.spawn_reader(dispatcher.clone());
    let client = SdoClient::from_config(&config.client_config(), Arc::new(bus), dispatcher);

    let result = run(&client, dictionary, cli.command).await;
    reader.abort();
    result
}

async fn run(client: &SdoClient, dictionary: Option<Dictionary>, command: Command) -> Result<(), Box<dyn Error>> {
    match (command, dictionary) {
        (Command::Read { target, sub_index }, Some(mut dictionary)) => {
            let entry = client
                .upload(&mut dictionary, &Target::parse(&target), sub_index, None)
                .await?;
            let value = entry.value.map_or_else(String::new, |value| value.to_string());
            println!("0x{:04X}:{:02X} {} = {}", entry.index, entry.sub_index, entry.name, value);
        }
        (Command::Write { target, sub_index, value }, Some(mut dictionary)) => {
            let target = Target::parse(&target);
            let data_type = dictionary.lookup(&target, sub_index)?.data_type;
            let value = data_type.parse(&value)?;

            let entry = client
                .download(&mut dictionary, &target, sub_index, &value, None)
                .await?;
            println!("0x{:04X}:{:02X} {} <- {}", entry.index, entry.sub_index, entry.name, value);
        }
        (Command::Read { target, sub_index }, None) => {
            let index = raw_index(&target)?;
            let raw = client.upload_raw(index, sub_index, None).await?;
            println!("0x{:04X}:{:02X} = {}", index, sub_index, Value::Bytes(raw));
        }
        (Command::Write { target, sub_index, value }, None) => {
            let index = raw_index(&target)?;
            let Value::Bytes(raw) = DataType::OctetString.parse(&value)? else {
                return Err("expected hex bytes".into());
            };
            client.download_raw(index, sub_index, raw, None).await?;
            println!("0x{:04X}:{:02X} <- {}", index, sub_index, value);
        }
        (Command::List | Command::SaveConfig, _) => {}
    }

    Ok(())
}

/// Without an EDS only numeric indexes can be addressed.
fn raw_index(target: &str) -> Result<u16, Box<dyn Error>> {
    match Target::parse(target) {
        Target::Index(index) => Ok(index),
        Target::Name(name) => Err(format!("{:?} is not an index; names need an EDS file (--eds)", name).into()),
    }
}
