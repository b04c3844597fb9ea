//! SDO client bound to one remote node.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::dictionary::{Entry, ObjectDictionary, Target};
use crate::error::SdoError;
use crate::frame::{self, SdoFrame};
use crate::transfer::{Step, Transfer};
use crate::transport::{Dispatcher, Protocol, Transport};
use crate::value::{EncodedValue, Value};

/// Timeout applied when an operation does not specify one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT.as_millis() as u64
}

/// Serializable client settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub node_id: u8,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            timeout_ms: default_timeout_ms(),
        }
    }
}

/// Runs uploads and downloads against a single node, one at a time.
pub struct SdoClient {
    node_id: u8,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    timeout: Duration,
    busy: AtomicBool,
}

/// Clears the busy flag on every exit path, including cancellation.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SdoClient {
    pub fn new(node_id: u8, transport: Arc<dyn Transport>, dispatcher: Dispatcher) -> Self {
        Self {
            node_id,
            transport,
            dispatcher,
            timeout: DEFAULT_TIMEOUT,
            busy: AtomicBool::new(false),
        }
    }

    pub fn from_config(config: &ClientConfig, transport: Arc<dyn Transport>, dispatcher: Dispatcher) -> Self {
        Self::new(config.node_id, transport, dispatcher)
            .with_timeout(Duration::from_millis(config.timeout_ms))
    }

    /// Override the default per-operation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn node_id(&self) -> u8 {
        self.node_id
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a transfer is currently in flight.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Write `value` to the entry `target:sub_index` of the node.
    ///
    /// The value is encoded with the entry's data type; on success the entry
    /// holds the written value and is returned.
    pub async fn download<D>(
        &self,
        dictionary: &mut D,
        target: &Target,
        sub_index: u8,
        value: &Value,
        timeout: Option<Duration>,
    ) -> Result<Entry, SdoError>
    where
        D: ObjectDictionary + ?Sized,
    {
        let entry = dictionary.lookup(target, sub_index)?;
        let encoded = entry.data_type.encode(value)?;

        self.download_raw(entry.index, sub_index, encoded.raw.clone(), timeout)
            .await?;

        entry.store(encoded);
        Ok(entry.clone())
    }

    /// Read the entry `target:sub_index` of the node and store the decoded value.
    pub async fn upload<D>(
        &self,
        dictionary: &mut D,
        target: &Target,
        sub_index: u8,
        timeout: Option<Duration>,
    ) -> Result<Entry, SdoError>
    where
        D: ObjectDictionary + ?Sized,
    {
        let entry = dictionary.lookup(target, sub_index)?;
        let transfer = self.read(entry.index, sub_index, timeout).await?;
        let exact = transfer.total_size().is_some();
        let mut raw = transfer.into_data();

        if let Some(width) = entry.data_type.fixed_size() {
            if raw.len() > width {
                // Only unindicated expedited payloads may carry padding
                if exact {
                    return Err(SdoError::Value(format!(
                        "0x{:04X}:{:02X} returned {} bytes, {:?} holds {}",
                        entry.index,
                        sub_index,
                        raw.len(),
                        entry.data_type,
                        width
                    )));
                }
                raw.truncate(width);
            }
        }

        let value = entry.data_type.decode(&raw)?;
        entry.store(EncodedValue {
            value,
            size: raw.len(),
            raw,
        });
        Ok(entry.clone())
    }

    /// Write raw bytes to `index:sub_index` without consulting a dictionary.
    pub async fn download_raw(
        &self,
        index: u16,
        sub_index: u8,
        raw: Vec<u8>,
        timeout: Option<Duration>,
    ) -> Result<(), SdoError> {
        let deadline = Instant::now() + timeout.unwrap_or(self.timeout);
        let size = raw.len();
        self.execute(Transfer::download(index, sub_index, raw, deadline))
            .await?;

        info!(
            "Node {}: wrote {} bytes to 0x{:04X}:{:02X}",
            self.node_id, size, index, sub_index
        );
        Ok(())
    }

    /// Read raw bytes from `index:sub_index` without consulting a dictionary.
    pub async fn upload_raw(
        &self,
        index: u16,
        sub_index: u8,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, SdoError> {
        Ok(self.read(index, sub_index, timeout).await?.into_data())
    }

    async fn read(
        &self,
        index: u16,
        sub_index: u8,
        timeout: Option<Duration>,
    ) -> Result<Transfer, SdoError> {
        let deadline = Instant::now() + timeout.unwrap_or(self.timeout);
        let transfer = self
            .execute(Transfer::upload(index, sub_index, deadline))
            .await?;

        info!(
            "Node {}: read {} bytes from 0x{:04X}:{:02X}",
            self.node_id,
            transfer.data().len(),
            index,
            sub_index
        );
        Ok(transfer)
    }

    fn claim(&self) -> Result<BusyGuard<'_>, SdoError> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| BusyGuard(&self.busy))
            .map_err(|_| SdoError::Busy { node_id: self.node_id })
    }

    /// Drive `transfer` to its terminal state.
    ///
    /// The listener and the deadline timer live in this frame only, so both
    /// are released whichever way it returns.
    async fn execute(&self, mut transfer: Transfer) -> Result<Transfer, SdoError> {
        let _busy = self.claim()?;

        let mut listener = self.dispatcher.subscribe(Protocol::Sdo);
        let timer = tokio::time::sleep_until(transfer.deadline());
        tokio::pin!(timer);

        let initiate = transfer.start();
        self.send(&initiate)?;

        loop {
            let step = tokio::select! {
                biased;

                received = listener.recv() => match received {
                    Some(inbound) if inbound.node_id == self.node_id => {
                        let indication = frame::decode(&inbound.data);
                        debug!("<- 0x{:03X} {:02X?}", inbound.cob_id, inbound.data);
                        transfer.on_indication(&indication)
                    }
                    Some(_) => Step::Ignored,
                    None => return Err(SdoError::Disconnected),
                },
                _ = &mut timer => transfer.on_timeout(),
            };

            match step {
                Step::Ignored => {}
                Step::Send(frame) => self.send(&frame)?,
                Step::Completed => return Ok(transfer),
                Step::Aborted { code, reason, notify } => {
                    if let Some(notify) = notify {
                        self.notify(&notify);
                    }
                    warn!(
                        "Node {}: transfer of 0x{:04X}:{:02X} aborted 0x{:08X}: {}",
                        self.node_id,
                        transfer.index(),
                        transfer.sub_index(),
                        code,
                        reason
                    );
                    return Err(SdoError::ProtocolAbort { code, reason });
                }
                Step::TimedOut { notify } => {
                    self.notify(&notify);
                    warn!(
                        "Node {}: transfer of 0x{:04X}:{:02X} timed out",
                        self.node_id,
                        transfer.index(),
                        transfer.sub_index()
                    );
                    return Err(SdoError::Timeout {
                        index: transfer.index(),
                        sub_index: transfer.sub_index(),
                    });
                }
            }
        }
    }

    fn send(&self, frame: &SdoFrame) -> Result<(), SdoError> {
        self.transport
            .send(frame::request_cob_id(self.node_id), frame)
            .map_err(SdoError::from)
    }

    /// Best-effort abort notification; the transfer already failed.
    fn notify(&self, frame: &SdoFrame) {
        if let Err(err) = self.send(frame) {
            warn!("Node {}: failed to send abort: {}", self.node_id, err);
        }
    }
}
