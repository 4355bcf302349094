//! EPICS GPIB record adapter.
//!
//! Bridges to an EPICS "generic GPIB" record that exposes raw bus
//! primitives as process variables: `.ADDR` selects the device, `.BOUT`
//! and `.BINP` carry the payload bytes, `.TMOD`/`.EOS`/`.TMOT`/`.NRRD`/
//! `.NOWT` configure the transaction, and `.NORD` reports how many
//! bytes actually arrived. Every configuration PV is shadowed by a
//! local cache and written only when the desired value differs, since
//! each `caput` costs a network round trip to the IOC.
//!
//! Channel Access itself sits behind the [`ChannelAccess`] trait, so
//! the transaction logic is testable without an EPICS server.

use async_trait::async_trait;
use labbus_core::{
    AddressState, GpibAddress, GpibBus, GpibError, GpibSettings, Result, TransferFlags,
};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Transaction modes of the record's `.TMOD` menu.
pub const TMOD_WRITE_READ: i32 = 0;
/// Read-only transaction.
pub const TMOD_READ: i32 = 2;

/// `.IFMT`/`.OFMT` menu value for binary transfers.
pub const FORMAT_BINARY: i32 = 2;

/// Universal commands of the record's `.UCMD` menu.
pub mod ucmd {
    pub const DEVICE_CLEAR: i32 = 1;
    pub const LOCAL_LOCKOUT: i32 = 2;
    pub const SERIAL_POLL_DISABLE: i32 = 3;
    pub const SERIAL_POLL_ENABLE: i32 = 4;
}

/// Addressed commands of the record's `.ACMD` menu.
pub mod acmd {
    pub const GROUP_EXECUTE_TRIGGER: i32 = 1;
    pub const GO_TO_LOCAL: i32 = 2;
    pub const SELECTED_DEVICE_CLEAR: i32 = 3;
}

/// Default transaction timeout of the EPICS record, in milliseconds.
const DEFAULT_TIMEOUT_MS: i32 = 500;

/// Failures from a Channel Access client.
#[derive(Error, Debug)]
pub enum CaError {
    #[error("channel access timeout")]
    Timeout,
    #[error("channel access failure: {0}")]
    Failed(String),
}

/// Minimal Channel Access surface the adapter needs.
#[async_trait]
pub trait ChannelAccess: Send + Sync {
    async fn caget_long(&self, pv: &str) -> std::result::Result<i32, CaError>;

    async fn caput_long(&self, pv: &str, value: i32) -> std::result::Result<(), CaError>;

    async fn caget_bytes(
        &self,
        pv: &str,
        max_len: usize,
    ) -> std::result::Result<Vec<u8>, CaError>;

    async fn caput_bytes(&self, pv: &str, value: &[u8]) -> std::result::Result<(), CaError>;
}

/// Configuration for an EPICS GPIB interface.
#[derive(Debug, Clone, Deserialize)]
pub struct EpicsGpibConfig {
    /// Name of the EPICS GPIB record, e.g. "xyz:gpib0".
    pub record: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub gpib: GpibSettings,
}

fn default_name() -> String {
    "epics_gpib".to_string()
}

struct PvSet {
    addr: String,
    binp: String,
    bout: String,
    eos: String,
    nord: String,
    nowt: String,
    nrrd: String,
    tmod: String,
    tmot: String,
    ucmd: String,
    acmd: String,
    ifmt: String,
    ofmt: String,
    imax: String,
    omax: String,
}

impl PvSet {
    fn new(record: &str) -> Self {
        Self {
            addr: format!("{record}.ADDR"),
            binp: format!("{record}.BINP"),
            bout: format!("{record}.BOUT"),
            eos: format!("{record}.EOS"),
            nord: format!("{record}.NORD"),
            nowt: format!("{record}.NOWT"),
            nrrd: format!("{record}.NRRD"),
            tmod: format!("{record}.TMOD"),
            tmot: format!("{record}.TMOT"),
            ucmd: format!("{record}.UCMD"),
            acmd: format!("{record}.ACMD"),
            ifmt: format!("{record}.IFMT"),
            ofmt: format!("{record}.OFMT"),
            imax: format!("{record}.IMAX"),
            omax: format!("{record}.OMAX"),
        }
    }
}

/// Shadow copies of the record's configuration PVs. A value of `None`
/// means "unknown, must be written".
#[derive(Default)]
struct PvCache {
    address: Option<u8>,
    transaction_mode: Option<i32>,
    eos: Option<i32>,
    timeout_ms: Option<i32>,
    chars_to_read: Option<usize>,
    chars_to_write: Option<usize>,
}

/// Bus adapter over one EPICS GPIB record.
pub struct EpicsGpibBus {
    name: String,
    ca: Arc<dyn ChannelAccess>,
    pv: PvSet,
    max_input_length: usize,
    max_output_length: usize,
    cache: Mutex<PvCache>,
}

impl EpicsGpibBus {
    /// Program the record for binary transfers and learn its buffer
    /// limits.
    pub async fn open(
        name: String,
        ca: Arc<dyn ChannelAccess>,
        record: &str,
        settings: &GpibSettings,
    ) -> Result<Self> {
        let bus = Self {
            name,
            ca,
            pv: PvSet::new(record),
            max_input_length: 0,
            max_output_length: 0,
            cache: Mutex::new(PvCache::default()),
        };

        // Start from a clean bus.
        bus.caput_long(&bus.pv.ucmd, ucmd::DEVICE_CLEAR).await?;

        bus.caput_long(&bus.pv.ifmt, FORMAT_BINARY).await?;
        bus.caput_long(&bus.pv.ofmt, FORMAT_BINARY).await?;

        let imax = bus.caget_long(&bus.pv.imax).await?;
        let omax = bus.caget_long(&bus.pv.omax).await?;

        let eos = settings
            .read_terminator
            .single_byte()
            .map_err(|e| GpibError::illegal_argument(&bus.name, e.message))?
            .map(i32::from)
            .unwrap_or(0);
        bus.caput_long(&bus.pv.eos, eos).await?;
        bus.cache.lock().eos = Some(eos);

        debug!(
            interface = %bus.name,
            record, imax, omax, "EPICS GPIB record programmed"
        );

        Ok(Self {
            max_input_length: imax.max(0) as usize,
            max_output_length: omax.max(0) as usize,
            ..bus
        })
    }

    fn map_ca(&self, e: CaError, pv: &str) -> GpibError {
        match e {
            CaError::Timeout => {
                GpibError::timed_out(&self.name, format!("channel access timeout on '{pv}'"))
            }
            CaError::Failed(message) => {
                GpibError::interface_io(&self.name, format!("caput/caget on '{pv}' failed: {message}"))
            }
        }
    }

    async fn caget_long(&self, pv: &str) -> Result<i32> {
        self.ca.caget_long(pv).await.map_err(|e| self.map_ca(e, pv))
    }

    async fn caput_long(&self, pv: &str, value: i32) -> Result<()> {
        self.ca
            .caput_long(pv, value)
            .await
            .map_err(|e| self.map_ca(e, pv))
    }

    /// Write the transaction mode only when it differs from the cache.
    async fn set_transaction_mode(&self, mode: i32) -> Result<()> {
        if self.cache.lock().transaction_mode == Some(mode) {
            return Ok(());
        }
        self.caput_long(&self.pv.tmod, mode).await?;
        self.cache.lock().transaction_mode = Some(mode);
        Ok(())
    }

    async fn set_timeout(&self, flags: TransferFlags, state: &AddressState) -> Result<()> {
        let timeout_ms = if flags.nowait {
            DEFAULT_TIMEOUT_MS
        } else {
            state
                .io_timeout
                .map(|t| t.as_millis() as i32)
                .unwrap_or(DEFAULT_TIMEOUT_MS)
        };

        if self.cache.lock().timeout_ms == Some(timeout_ms) {
            return Ok(());
        }
        self.caput_long(&self.pv.tmot, timeout_ms).await?;
        self.cache.lock().timeout_ms = Some(timeout_ms);
        Ok(())
    }

    async fn set_eos(&self, state: &AddressState) -> Result<()> {
        let eos = state
            .read_terminator
            .single_byte()
            .map_err(|e| GpibError::illegal_argument(&self.name, e.message))?
            .map(i32::from)
            .unwrap_or(0);

        if self.cache.lock().eos == Some(eos) {
            return Ok(());
        }
        self.caput_long(&self.pv.eos, eos).await?;
        self.cache.lock().eos = Some(eos);
        Ok(())
    }

    async fn set_address(&self, address: GpibAddress) -> Result<()> {
        if self.cache.lock().address == Some(address.as_u8()) {
            return Ok(());
        }
        self.caput_long(&self.pv.addr, i32::from(address.as_u8()))
            .await?;
        self.cache.lock().address = Some(address.as_u8());
        Ok(())
    }

    async fn universal_command(&self, command: i32) -> Result<()> {
        self.caput_long(&self.pv.ucmd, command).await
    }

    async fn addressed_command(&self, address: GpibAddress, command: i32) -> Result<()> {
        self.set_address(address).await?;
        self.caput_long(&self.pv.acmd, command).await
    }
}

#[async_trait]
impl GpibBus for EpicsGpibBus {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(
        &self,
        address: GpibAddress,
        max_len: usize,
        flags: TransferFlags,
        state: &AddressState,
    ) -> Result<Vec<u8>> {
        if max_len > self.max_input_length {
            return Err(GpibError::would_exceed_limit(
                &self.name,
                format!(
                    "requested {max_len} characters but the record's input buffer \
                     holds only {}",
                    self.max_input_length
                ),
            ));
        }

        self.set_transaction_mode(TMOD_READ).await?;
        self.set_timeout(flags, state).await?;
        self.set_eos(state).await?;

        if self.cache.lock().chars_to_read != Some(max_len) {
            self.caput_long(&self.pv.nrrd, max_len as i32).await?;
            self.cache.lock().chars_to_read = Some(max_len);
        }

        self.set_address(address).await?;

        let mut data = self
            .ca
            .caget_bytes(&self.pv.binp, max_len)
            .await
            .map_err(|e| self.map_ca(e, &self.pv.binp))?;

        let bytes_read = self.caget_long(&self.pv.nord).await?.max(0) as usize;
        data.truncate(bytes_read);

        if flags.debug {
            debug!(
                interface = %self.name,
                %address,
                response = %String::from_utf8_lossy(&data),
                "read"
            );
        }
        Ok(data)
    }

    async fn write(
        &self,
        address: GpibAddress,
        data: &[u8],
        flags: TransferFlags,
        state: &AddressState,
    ) -> Result<usize> {
        if data.len() > self.max_output_length {
            return Err(GpibError::would_exceed_limit(
                &self.name,
                format!(
                    "requested {} characters but the record's output buffer \
                     holds only {}",
                    data.len(),
                    self.max_output_length
                ),
            ));
        }

        if flags.debug {
            debug!(
                interface = %self.name,
                %address,
                payload = %String::from_utf8_lossy(data),
                "write"
            );
        }

        self.set_transaction_mode(TMOD_WRITE_READ).await?;
        self.set_timeout(flags, state).await?;
        self.set_address(address).await?;

        if self.cache.lock().chars_to_write != Some(data.len()) {
            self.caput_long(&self.pv.nowt, data.len() as i32).await?;
            self.cache.lock().chars_to_write = Some(data.len());
        }

        self.ca
            .caput_bytes(&self.pv.bout, data)
            .await
            .map_err(|e| self.map_ca(e, &self.pv.bout))?;

        // The record offers no way to learn how many bytes actually
        // went out, so report the request size.
        Ok(data.len())
    }

    async fn device_clear(&self) -> Result<()> {
        self.universal_command(ucmd::DEVICE_CLEAR).await
    }

    async fn selective_device_clear(&self, address: GpibAddress) -> Result<()> {
        self.addressed_command(address, acmd::SELECTED_DEVICE_CLEAR)
            .await
    }

    async fn local_lockout(&self) -> Result<()> {
        self.universal_command(ucmd::LOCAL_LOCKOUT).await
    }

    async fn go_to_local(&self, address: GpibAddress) -> Result<()> {
        self.addressed_command(address, acmd::GO_TO_LOCAL).await
    }

    async fn trigger(&self, address: GpibAddress) -> Result<()> {
        self.addressed_command(address, acmd::GROUP_EXECUTE_TRIGGER)
            .await
    }

    async fn interface_clear(&self) -> Result<()> {
        Err(GpibError::not_implemented(&self.name, "interface clear"))
    }

    async fn remote_enable(&self, _address: GpibAddress) -> Result<()> {
        Err(GpibError::not_implemented(&self.name, "remote enable"))
    }

    async fn wait_for_service_request(&self, _timeout: Duration) -> Result<()> {
        Err(GpibError::not_implemented(
            &self.name,
            "wait for service request",
        ))
    }

    async fn serial_poll(&self, address: GpibAddress) -> Result<u8> {
        self.universal_command(ucmd::SERIAL_POLL_ENABLE).await?;

        let state = AddressState::new(&GpibSettings::default());
        let data = self.read(address, 1, TransferFlags::NONE, &state).await?;
        let byte = data.first().copied().ok_or_else(|| {
            GpibError::device_io(&self.name, "serial poll returned no status byte")
        })?;
        Ok(byte)
    }

    async fn serial_poll_disable(&self) -> Result<()> {
        self.universal_command(ucmd::SERIAL_POLL_DISABLE).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labbus_core::GpibErrorKind;
    use std::collections::HashMap;

    #[derive(Default)]
    struct CaState {
        longs: HashMap<String, i32>,
        bytes: HashMap<String, Vec<u8>>,
        put_counts: HashMap<String, usize>,
    }

    struct MockCa {
        state: Mutex<CaState>,
    }

    impl MockCa {
        fn new() -> Arc<Self> {
            let mut longs = HashMap::new();
            longs.insert("bl:gpib0.IMAX".to_string(), 1024);
            longs.insert("bl:gpib0.OMAX".to_string(), 1024);
            Arc::new(Self {
                state: Mutex::new(CaState {
                    longs,
                    ..CaState::default()
                }),
            })
        }

        fn put_count(&self, pv: &str) -> usize {
            self.state.lock().put_counts.get(pv).copied().unwrap_or(0)
        }

        fn stage_input(&self, data: &[u8]) {
            let mut state = self.state.lock();
            state
                .bytes
                .insert("bl:gpib0.BINP".to_string(), data.to_vec());
            state
                .longs
                .insert("bl:gpib0.NORD".to_string(), data.len() as i32);
        }
    }

    #[async_trait]
    impl ChannelAccess for MockCa {
        async fn caget_long(&self, pv: &str) -> std::result::Result<i32, CaError> {
            Ok(self.state.lock().longs.get(pv).copied().unwrap_or(0))
        }

        async fn caput_long(&self, pv: &str, value: i32) -> std::result::Result<(), CaError> {
            let mut state = self.state.lock();
            state.longs.insert(pv.to_string(), value);
            *state.put_counts.entry(pv.to_string()).or_insert(0) += 1;
            Ok(())
        }

        async fn caget_bytes(
            &self,
            pv: &str,
            max_len: usize,
        ) -> std::result::Result<Vec<u8>, CaError> {
            let mut data = self.state.lock().bytes.get(pv).cloned().unwrap_or_default();
            data.truncate(max_len);
            Ok(data)
        }

        async fn caput_bytes(&self, pv: &str, value: &[u8]) -> std::result::Result<(), CaError> {
            let mut state = self.state.lock();
            state.bytes.insert(pv.to_string(), value.to_vec());
            *state.put_counts.entry(pv.to_string()).or_insert(0) += 1;
            Ok(())
        }
    }

    async fn open_bus(ca: Arc<MockCa>) -> EpicsGpibBus {
        EpicsGpibBus::open(
            "epics0".into(),
            ca,
            "bl:gpib0",
            &GpibSettings::default(),
        )
        .await
        .unwrap()
    }

    fn addr(n: u8) -> GpibAddress {
        GpibAddress::try_from(n).unwrap()
    }

    fn state() -> AddressState {
        AddressState::new(&GpibSettings::default())
    }

    #[tokio::test]
    async fn open_programs_binary_format_and_learns_limits() {
        let ca = MockCa::new();
        let bus = open_bus(ca.clone()).await;

        assert_eq!(bus.max_input_length, 1024);
        assert_eq!(bus.max_output_length, 1024);
        assert_eq!(ca.put_count("bl:gpib0.IFMT"), 1);
        assert_eq!(ca.put_count("bl:gpib0.OFMT"), 1);
        assert_eq!(ca.put_count("bl:gpib0.EOS"), 1);
        assert_eq!(ca.put_count("bl:gpib0.UCMD"), 1);
    }

    #[tokio::test]
    async fn repeated_reads_write_each_configuration_pv_once() {
        let ca = MockCa::new();
        let bus = open_bus(ca.clone()).await;
        ca.stage_input(b"VALUE 1\n");

        for _ in 0..3 {
            bus.read(addr(6), 64, TransferFlags::NONE, &state())
                .await
                .unwrap();
        }

        assert_eq!(ca.put_count("bl:gpib0.TMOD"), 1);
        assert_eq!(ca.put_count("bl:gpib0.ADDR"), 1);
        assert_eq!(ca.put_count("bl:gpib0.NRRD"), 1);
        assert_eq!(ca.put_count("bl:gpib0.TMOT"), 1);
        // EOS was already programmed during open with the same value.
        assert_eq!(ca.put_count("bl:gpib0.EOS"), 1);
    }

    #[tokio::test]
    async fn address_changes_invalidate_only_the_address_pv() {
        let ca = MockCa::new();
        let bus = open_bus(ca.clone()).await;
        ca.stage_input(b"X");

        bus.read(addr(6), 64, TransferFlags::NONE, &state())
            .await
            .unwrap();
        bus.read(addr(9), 64, TransferFlags::NONE, &state())
            .await
            .unwrap();

        assert_eq!(ca.put_count("bl:gpib0.ADDR"), 2);
        assert_eq!(ca.put_count("bl:gpib0.TMOD"), 1);
    }

    #[tokio::test]
    async fn read_truncates_to_the_reported_count() {
        let ca = MockCa::new();
        let bus = open_bus(ca.clone()).await;

        {
            let mut state = ca.state.lock();
            state
                .bytes
                .insert("bl:gpib0.BINP".to_string(), b"PARTIAL_DATA".to_vec());
            state.longs.insert("bl:gpib0.NORD".to_string(), 7);
        }

        let data = bus
            .read(addr(3), 64, TransferFlags::NONE, &state())
            .await
            .unwrap();
        assert_eq!(data, b"PARTIAL");
    }

    #[tokio::test]
    async fn oversized_transfers_are_rejected() {
        let ca = MockCa::new();
        let bus = open_bus(ca).await;

        let err = bus
            .read(addr(3), 4096, TransferFlags::NONE, &state())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::WouldExceedLimit);

        let big = vec![b'x'; 4096];
        let err = bus
            .write(addr(3), &big, TransferFlags::NONE, &state())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), GpibErrorKind::WouldExceedLimit);
    }

    #[tokio::test]
    async fn write_reports_the_request_size_and_caches_nowt() {
        let ca = MockCa::new();
        let bus = open_bus(ca.clone()).await;

        assert_eq!(
            bus.write(addr(2), b"*RST", TransferFlags::NONE, &state())
                .await
                .unwrap(),
            4
        );
        bus.write(addr(2), b"*CLS", TransferFlags::NONE, &state())
            .await
            .unwrap();

        // Same length twice, so NOWT was written once.
        assert_eq!(ca.put_count("bl:gpib0.NOWT"), 1);
        assert_eq!(
            ca.state.lock().bytes.get("bl:gpib0.BOUT").unwrap(),
            &b"*CLS".to_vec()
        );
    }

    #[tokio::test]
    async fn serial_poll_enables_polls_and_reads_one_byte() {
        let ca = MockCa::new();
        let bus = open_bus(ca.clone()).await;
        ca.stage_input(&[0x50]);

        let byte = bus.serial_poll(addr(4)).await.unwrap();
        assert_eq!(byte, 0x50);

        // DEVICE_CLEAR during open plus SERIAL_POLL_ENABLE.
        assert_eq!(ca.put_count("bl:gpib0.UCMD"), 2);
    }
}
