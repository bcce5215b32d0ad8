//! Persistent device configuration.
//!
//! A single versioned structure lives in one flash page, bracketed by
//! top/bottom signatures. Loads that fail the signature or version
//! check fall back to defaults and rewrite the page, so the device
//! always boots with a coherent configuration. Saves are whole-page
//! erase+write through the [`FlashPage`] contract; the in-memory
//! implementation backs tests and the host simulator.
//!
//! Each configuration family (device, service, GPS, sensor, TTN, DFU)
//! also round-trips as a compact text string for the operator CLI and
//! the periodic configuration snapshots sent to the service.

use std::fmt;

use bitflags::bitflags;
use log::{info, warn};

/// Flash page size; the serialized structure must fit.
pub const PAGE_SIZE: usize = 1024;

/// Signature bracketing the stored structure.
pub const VALID_SIGNATURE: u32 = 0x5454_4E4F;

/// Lowest/highest structure versions this firmware understands.
pub const MIN_SUPPORTED_VERSION: u16 = 1;
pub const MAX_SUPPORTED_VERSION: u16 = 1;

/// Product identifiers for group configuration matching.
pub const PRODUCT_SIMPLECAST: u16 = 0;
pub const PRODUCT_SOLARCAST: u16 = 1;

/// Default days between scheduled restarts.
pub const DEFAULT_RESTART_DAYS: u16 = 7;

/// Default oneshot cadence when a cellular WAN is configured.
pub const ONESHOT_MINUTES: u16 = 15;

/// Default cadence for draining buffered cellular uploads.
pub const ONESHOT_CELL_UPLOAD_MINUTES: u16 = 120;

bitflags! {
    /// Feature flags stored in configuration.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StorageFlags: u32 {
        /// Periodically ping the service from the poll loop.
        const PING = 0x0000_0001;
        /// Relay received Telecast traffic to the phone channel.
        const RELAY = 0x0000_0002;
    }
}

bitflags! {
    /// Which physical sensors are populated on this board.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SensorMask: u32 {
        const GEIGER0    = 0x0000_0001;
        const GEIGER1    = 0x0000_0002;
        const UGPS       = 0x0000_0004;
        const BME0       = 0x0000_0008;
        const BME1       = 0x0000_0010;
        const INA        = 0x0000_0020;
        const LIS        = 0x0000_0040;
        const PMS        = 0x0000_0080;
        const OPC        = 0x0000_0100;
        const AIR_COUNTS = 0x0000_0200;
    }
}

/// Which wide-area transport the device should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WanMode {
    None = 0,
    Lora = 1,
    Lorawan = 2,
    LoraThenLorawan = 3,
    LorawanThenLora = 4,
    Fona = 5,
    Auto = 6,
}

impl WanMode {
    pub fn from_u8(v: u8) -> WanMode {
        match v {
            1 => WanMode::Lora,
            2 => WanMode::Lorawan,
            3 => WanMode::LoraThenLorawan,
            4 => WanMode::LorawanThenLora,
            5 => WanMode::Fona,
            6 => WanMode::Auto,
            _ => WanMode::None,
        }
    }

    /// True for every mode whose primary transport is LoRa/LoRaWAN.
    pub fn is_lora_family(self) -> bool {
        matches!(
            self,
            WanMode::Lora | WanMode::Lorawan | WanMode::LoraThenLorawan | WanMode::LorawanThenLora
        )
    }
}

/// Firmware-update request state, persisted across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DfuStatus {
    Idle = 0,
    Pending = 1,
}

impl DfuStatus {
    pub fn from_u8(v: u8) -> DfuStatus {
        if v == 1 {
            DfuStatus::Pending
        } else {
            DfuStatus::Idle
        }
    }
}

/// Outcome of the most recent firmware-update attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum DfuError {
    None = 0,
    Basic = 1,
    GetFile = 2,
    Transfer = 3,
    Prepare = 4,
    NoNetwork = 5,
    Reset = 6,
}

impl DfuError {
    pub fn from_u16(v: u16) -> DfuError {
        match v {
            1 => DfuError::Basic,
            2 => DfuError::GetFile,
            3 => DfuError::Transfer,
            4 => DfuError::Prepare,
            5 => DfuError::NoNetwork,
            6 => DfuError::Reset,
            _ => DfuError::None,
        }
    }
}

/// Errors from the storage subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    Truncated,
    BadSignature,
    UnsupportedVersion(u16),
    TooLarge(usize),
    Flash(&'static str),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Truncated => write!(f, "stored image truncated"),
            StorageError::BadSignature => write!(f, "stored image signature mismatch"),
            StorageError::UnsupportedVersion(v) => write!(f, "unsupported storage version {}", v),
            StorageError::TooLarge(n) => write!(f, "serialized image is {} bytes (page is {})", n, PAGE_SIZE),
            StorageError::Flash(msg) => write!(f, "flash error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// The persisted configuration structure (version 1).
#[derive(Debug, Clone, PartialEq)]
pub struct Storage {
    pub wan: WanMode,
    pub product: u16,
    pub flags: StorageFlags,
    pub oneshot_minutes: u16,
    pub oneshot_cell_minutes: u16,
    pub restart_days: u16,
    pub sensors: SensorMask,
    pub device_id: u32,
    pub lpwan_region: String,
    pub carrier_apn: String,
    pub service_addr: String,
    pub service_udp_port: u16,
    pub service_http_port: u16,
    pub gps_latitude: f64,
    pub gps_longitude: f64,
    pub gps_altitude: f64,
    pub lkg_gps_latitude: f64,
    pub lkg_gps_longitude: f64,
    pub lkg_gps_altitude: f64,
    /// Per-group overrides, e.g. `g-air.r=15/g-geigers.r=5`.
    pub sensor_params: String,
    /// LoRa listen tags for TTAPP text-message filtering.
    pub listen_tags: String,
    pub dfu_filename: String,
    pub dfu_status: DfuStatus,
    pub dfu_error: DfuError,
    pub dfu_count: u16,
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            wan: WanMode::Auto,
            product: PRODUCT_SOLARCAST,
            flags: StorageFlags::empty(),
            oneshot_minutes: ONESHOT_MINUTES,
            oneshot_cell_minutes: ONESHOT_CELL_UPLOAD_MINUTES,
            restart_days: DEFAULT_RESTART_DAYS,
            sensors: SensorMask::all(),
            device_id: 0,
            lpwan_region: String::new(),
            carrier_apn: String::new(),
            service_addr: "ingest.telecast.io".to_string(),
            service_udp_port: 8081,
            service_http_port: 8080,
            gps_latitude: 0.0,
            gps_longitude: 0.0,
            gps_altitude: 0.0,
            lkg_gps_latitude: 0.0,
            lkg_gps_longitude: 0.0,
            lkg_gps_altitude: 0.0,
            sensor_params: String::new(),
            listen_tags: String::new(),
            dfu_filename: String::new(),
            dfu_status: DfuStatus::Idle,
            dfu_error: DfuError::None,
            dfu_count: 0,
        }
    }
}

// ==================== Page image ====================

struct Writer {
    out: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn f64(&mut self, v: f64) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }
    fn str(&mut self, v: &str) {
        let bytes = v.as_bytes();
        let len = bytes.len().min(u8::MAX as usize);
        self.u8(len as u8);
        self.out.extend_from_slice(&bytes[..len]);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], StorageError> {
        if self.at + n > self.data.len() {
            return Err(StorageError::Truncated);
        }
        let slice = &self.data[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }
    fn u8(&mut self) -> Result<u8, StorageError> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16, StorageError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
    fn u32(&mut self) -> Result<u32, StorageError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn f64(&mut self) -> Result<f64, StorageError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(f64::from_le_bytes(buf))
    }
    fn str(&mut self) -> Result<String, StorageError> {
        let len = self.u8()? as usize;
        let b = self.take(len)?;
        Ok(String::from_utf8_lossy(b).into_owned())
    }
}

impl Storage {
    /// Serialize to a full page image, signatures included.
    pub fn to_page(&self) -> Result<Vec<u8>, StorageError> {
        let mut w = Writer { out: Vec::with_capacity(PAGE_SIZE) };
        w.u32(VALID_SIGNATURE);
        w.u16(MAX_SUPPORTED_VERSION);
        w.u8(self.wan as u8);
        w.u16(self.product);
        w.u32(self.flags.bits());
        w.u16(self.oneshot_minutes);
        w.u16(self.oneshot_cell_minutes);
        w.u16(self.restart_days);
        w.u32(self.sensors.bits());
        w.u32(self.device_id);
        w.str(&self.lpwan_region);
        w.str(&self.carrier_apn);
        w.str(&self.service_addr);
        w.u16(self.service_udp_port);
        w.u16(self.service_http_port);
        w.f64(self.gps_latitude);
        w.f64(self.gps_longitude);
        w.f64(self.gps_altitude);
        w.f64(self.lkg_gps_latitude);
        w.f64(self.lkg_gps_longitude);
        w.f64(self.lkg_gps_altitude);
        w.str(&self.sensor_params);
        w.str(&self.listen_tags);
        w.str(&self.dfu_filename);
        w.u8(self.dfu_status as u8);
        w.u16(self.dfu_error as u16);
        w.u16(self.dfu_count);
        w.u32(VALID_SIGNATURE);
        if w.out.len() > PAGE_SIZE {
            return Err(StorageError::TooLarge(w.out.len()));
        }
        w.out.resize(PAGE_SIZE, 0xff);
        Ok(w.out)
    }

    /// Parse a page image, validating signatures and version.
    pub fn from_page(page: &[u8]) -> Result<Storage, StorageError> {
        let mut r = Reader { data: page, at: 0 };
        if r.u32()? != VALID_SIGNATURE {
            return Err(StorageError::BadSignature);
        }
        let version = r.u16()?;
        if !(MIN_SUPPORTED_VERSION..=MAX_SUPPORTED_VERSION).contains(&version) {
            return Err(StorageError::UnsupportedVersion(version));
        }
        let storage = Storage {
            wan: WanMode::from_u8(r.u8()?),
            product: r.u16()?,
            flags: StorageFlags::from_bits_truncate(r.u32()?),
            oneshot_minutes: r.u16()?,
            oneshot_cell_minutes: r.u16()?,
            restart_days: r.u16()?,
            sensors: SensorMask::from_bits_truncate(r.u32()?),
            device_id: r.u32()?,
            lpwan_region: r.str()?,
            carrier_apn: r.str()?,
            service_addr: r.str()?,
            service_udp_port: r.u16()?,
            service_http_port: r.u16()?,
            gps_latitude: r.f64()?,
            gps_longitude: r.f64()?,
            gps_altitude: r.f64()?,
            lkg_gps_latitude: r.f64()?,
            lkg_gps_longitude: r.f64()?,
            lkg_gps_altitude: r.f64()?,
            sensor_params: r.str()?,
            listen_tags: r.str()?,
            dfu_filename: r.str()?,
            dfu_status: DfuStatus::from_u8(r.u8()?),
            dfu_error: DfuError::from_u16(r.u16()?),
            dfu_count: r.u16()?,
        };
        if r.u32()? != VALID_SIGNATURE {
            return Err(StorageError::BadSignature);
        }
        Ok(storage)
    }

    // ==================== Params as strings ====================

    pub fn device_params_help() -> &'static str {
        "wan.prod.flags.1shotMin.1shotCellMin.bootDays.sensors.deviceID"
    }

    pub fn device_params_as_string(&self) -> Option<String> {
        Some(format!(
            "{}.{}.{}.{}.{}.{}.{}.{}",
            self.wan as u8,
            self.product,
            self.flags.bits(),
            self.oneshot_minutes,
            self.oneshot_cell_minutes,
            self.restart_days,
            self.sensors.bits(),
            self.device_id
        ))
    }

    pub fn set_device_params_from_string(&mut self, s: &str) {
        let mut fields = s.split('.');
        let mut next = |target: &mut dyn FnMut(u32)| {
            if let Some(field) = fields.next() {
                if let Ok(v) = field.trim().parse::<u32>() {
                    target(v);
                }
            }
        };
        next(&mut |v| self.wan = WanMode::from_u8(v as u8));
        next(&mut |v| self.product = v as u16);
        next(&mut |v| self.flags = StorageFlags::from_bits_truncate(v));
        next(&mut |v| self.oneshot_minutes = v as u16);
        next(&mut |v| self.oneshot_cell_minutes = v as u16);
        next(&mut |v| self.restart_days = v as u16);
        next(&mut |v| self.sensors = SensorMask::from_bits_truncate(v));
        next(&mut |v| self.device_id = v);
    }

    pub fn service_params_help() -> &'static str {
        "region/apn"
    }

    pub fn service_params_as_string(&self) -> Option<String> {
        Some(format!("{}/{}", self.lpwan_region, self.carrier_apn))
    }

    pub fn set_service_params_from_string(&mut self, s: &str) {
        let mut fields = s.splitn(2, '/');
        if let Some(region) = fields.next() {
            self.lpwan_region = region.to_string();
        }
        if let Some(apn) = fields.next() {
            self.carrier_apn = apn.to_string();
        }
    }

    pub fn ttn_params_help() -> &'static str {
        "listen-tags"
    }

    pub fn ttn_params_as_string(&self) -> Option<String> {
        if self.listen_tags.is_empty() {
            None
        } else {
            Some(self.listen_tags.clone())
        }
    }

    pub fn set_ttn_params_from_string(&mut self, s: &str) {
        self.listen_tags = s.to_string();
    }

    pub fn gps_params_help() -> &'static str {
        "lat/lon/alt"
    }

    pub fn gps_params_as_string(&self) -> Option<String> {
        if self.gps_latitude == 0.0 && self.gps_longitude == 0.0 && self.gps_altitude == 0.0 {
            return None;
        }
        Some(format!(
            "{}/{}/{}",
            self.gps_latitude, self.gps_longitude, self.gps_altitude
        ))
    }

    pub fn set_gps_params_from_string(&mut self, s: &str) {
        let mut fields = s.split('/');
        if let Some(Ok(v)) = fields.next().map(str::parse::<f64>) {
            self.gps_latitude = v;
        }
        if let Some(Ok(v)) = fields.next().map(str::parse::<f64>) {
            self.gps_longitude = v;
        }
        if let Some(Ok(v)) = fields.next().map(str::parse::<f64>) {
            self.gps_altitude = v;
        }
    }

    pub fn sensor_params_help() -> &'static str {
        "g-air.r=15/g-geigers.r=5"
    }

    pub fn sensor_params_as_string(&self) -> Option<String> {
        if self.sensor_params.is_empty() {
            None
        } else {
            Some(self.sensor_params.clone())
        }
    }

    pub fn set_sensor_params_from_string(&mut self, s: &str) {
        self.sensor_params = s.to_string();
    }

    pub fn dfu_state_help() -> &'static str {
        "filename/count/status/error"
    }

    pub fn dfu_state_as_string(&self) -> Option<String> {
        Some(format!(
            "{}/{}/{}/{}",
            self.dfu_filename, self.dfu_count, self.dfu_status as u8, self.dfu_error as u16
        ))
    }

    pub fn set_dfu_state_from_string(&mut self, s: &str) {
        let mut fields = s.split('/');
        if let Some(name) = fields.next() {
            self.dfu_filename = name.to_string();
        }
        if let Some(Ok(v)) = fields.next().map(str::parse::<u16>) {
            self.dfu_count = v;
        }
        if let Some(Ok(v)) = fields.next().map(str::parse::<u8>) {
            self.dfu_status = DfuStatus::from_u8(v);
        }
        if let Some(Ok(v)) = fields.next().map(str::parse::<u16>) {
            self.dfu_error = DfuError::from_u16(v);
        }
    }
}

// ==================== Flash contract ====================

/// Whole-page persistence. Real hardware implements this over flash
/// with atomic erase+write; tests and the host simulator keep it in
/// memory.
pub trait FlashPage {
    /// Read the page; false when nothing has ever been stored.
    fn load(&mut self, page: &mut [u8]) -> bool;
    /// Erase and rewrite the page.
    fn store(&mut self, page: &[u8]) -> Result<(), StorageError>;
}

/// In-memory page for tests and host simulation.
pub struct MemFlash {
    page: Option<Vec<u8>>,
}

impl MemFlash {
    pub fn new() -> Self {
        Self { page: None }
    }

    pub fn with_page(page: Vec<u8>) -> Self {
        Self { page: Some(page) }
    }
}

impl Default for MemFlash {
    fn default() -> Self {
        Self::new()
    }
}

impl FlashPage for MemFlash {
    fn load(&mut self, page: &mut [u8]) -> bool {
        match &self.page {
            Some(stored) => {
                let n = stored.len().min(page.len());
                page[..n].copy_from_slice(&stored[..n]);
                true
            }
            None => false,
        }
    }

    fn store(&mut self, page: &[u8]) -> Result<(), StorageError> {
        self.page = Some(page.to_vec());
        Ok(())
    }
}

/// The live configuration plus its backing page.
pub struct Store {
    pub data: Storage,
    flash: Box<dyn FlashPage>,
}

impl Store {
    /// Load and validate the stored configuration, rewriting defaults
    /// when the image is absent, corrupt, or from an unsupported
    /// version.
    pub fn init(mut flash: Box<dyn FlashPage>) -> Self {
        let mut page = vec![0u8; PAGE_SIZE];
        let loaded = flash.load(&mut page);
        let (data, rewrite) = if loaded {
            match Storage::from_page(&page) {
                Ok(data) => {
                    info!("loaded valid params from storage");
                    (data, false)
                }
                Err(e) => {
                    warn!("storage invalid ({}), using defaults", e);
                    (Storage::default(), true)
                }
            }
        } else {
            info!("storage empty, using defaults");
            (Storage::default(), true)
        };
        let mut store = Self { data, flash };
        if rewrite {
            store.save();
        }
        store
    }

    /// Convenience constructor over [`MemFlash`].
    pub fn in_memory() -> Self {
        Self::init(Box::new(MemFlash::new()))
    }

    /// Persist the current configuration.
    pub fn save(&mut self) {
        match self.data.to_page() {
            Ok(page) => {
                if let Err(e) = self.flash.store(&page) {
                    warn!("flash storage save error: {}", e);
                }
            }
            Err(e) => warn!("storage serialize error: {}", e),
        }
    }
}
