//! Session parameters and card identity
//!
//! `Parameters` is built once per session (in code, from a JSON file, or from
//! environment defaults) and only read afterwards.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, ParameterError, Result};

/// Lock directory (set at compile time via build.rs)
pub const DEFAULT_LOCK_DIR: &str = match option_env!("ROC_DEFAULT_LOCK_DIR") {
    Some(s) => s,
    None => "/dev/shm/readoutcard",
};

/// PCI device directory (set at compile time via build.rs)
pub const DEFAULT_SYSFS_ROOT: &str = match option_env!("ROC_DEFAULT_SYSFS_ROOT") {
    Some(s) => s,
    None => "/sys/bus/pci/devices",
};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(10);
const DEFAULT_ARRIVAL_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Card identity
// ============================================================================

/// PCI bus/device/function address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PciAddress {
    pub domain: u16,
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl FromStr for PciAddress {
    type Err = Error;

    /// Accepts `bb:dd.f` and `dddd:bb:dd.f` (hex fields)
    fn from_str(s: &str) -> Result<Self> {
        let parse_error = || Error::Parse(format!("invalid PCI address '{}'", s));
        let hex = |field: &str, max: u32| -> Result<u32> {
            match u32::from_str_radix(field, 16) {
                Ok(v) if v <= max && !field.is_empty() => Ok(v),
                _ => Err(parse_error()),
            }
        };

        let (domain, rest) = match s.matches(':').count() {
            1 => ("0", s),
            2 => s.split_once(':').ok_or_else(parse_error)?,
            _ => return Err(parse_error()),
        };
        let (bus, rest) = rest.split_once(':').ok_or_else(parse_error)?;
        let (device, function) = rest.split_once('.').ok_or_else(parse_error)?;

        Ok(PciAddress {
            domain: hex(domain, 0xFFFF)? as u16,
            bus: hex(bus, 0xFF)? as u8,
            device: hex(device, 0x1F)? as u8,
            function: hex(function, 0x7)? as u8,
        })
    }
}

impl fmt::Display for PciAddress {
    /// Full sysfs form, e.g. `0000:04:00.0`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.domain, self.bus, self.device, self.function
        )
    }
}

/// Opaque locator of a physical card
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CardId {
    Pci(PciAddress),
    /// Position among supported cards in sysfs order, written `#N`
    Sequence(u32),
}

impl FromStr for CardId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Some(number) = s.strip_prefix('#') {
            return number
                .parse()
                .map(CardId::Sequence)
                .map_err(|_| Error::Parse(format!("invalid card sequence number '{}'", s)));
        }
        s.parse().map(CardId::Pci)
    }
}

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardId::Pci(address) => write!(f, "{}", address),
            CardId::Sequence(n) => write!(f, "#{}", n),
        }
    }
}

impl Serialize for CardId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CardId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Card generations
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CardType {
    Crorc,
    Cru,
}

impl CardType {
    pub const ALL: [CardType; 2] = [CardType::Crorc, CardType::Cru];

    pub fn pci_id(&self) -> (u16, u16) {
        match self {
            CardType::Crorc => (0x10dc, 0x0033),
            CardType::Cru => (0x1172, 0xe001),
        }
    }

    pub fn from_pci_id(vendor: u16, device: u16) -> Option<CardType> {
        Self::ALL.into_iter().find(|t| t.pci_id() == (vendor, device))
    }

    /// Channels are reached through the BAR with the same index
    pub fn channels(&self) -> &'static [u32] {
        match self {
            CardType::Crorc => &[0, 1, 2, 3, 4, 5],
            CardType::Cru => &[0, 2],
        }
    }

    pub fn check_channel(&self, channel: u32) -> Result<()> {
        if self.channels().contains(&channel) {
            Ok(())
        } else {
            Err(Error::InvalidLinkId {
                link: channel,
                card: self.to_string(),
            })
        }
    }
}

impl fmt::Display for CardType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CardType::Crorc => f.write_str("C-RORC"),
            CardType::Cru => f.write_str("CRU"),
        }
    }
}

/// Medium used to arbitrate channel ownership between processes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockMedium {
    /// Advisory `flock` on the record file, released by the kernel on exit
    #[default]
    File,
    /// Abstract unix socket name, released by the kernel on exit
    Socket,
}

impl FromStr for LockMedium {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "file" => Ok(LockMedium::File),
            "socket" => Ok(LockMedium::Socket),
            _ => Err(Error::Parse(format!("unknown lock medium '{}'", s))),
        }
    }
}

// ============================================================================
// Parameters
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Parameters {
    card_id: CardId,
    channel_number: u32,
    #[serde(default)]
    card_type: Option<CardType>,
    #[serde(default)]
    lock_medium: LockMedium,
    #[serde(default = "default_lock_timeout_ms")]
    lock_timeout_ms: u64,
    #[serde(default = "default_arrival_timeout_ms")]
    arrival_timeout_ms: u64,
    #[serde(default = "default_lock_dir")]
    lock_dir: PathBuf,
    #[serde(default = "default_sysfs_root")]
    sysfs_root: PathBuf,
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT.as_millis() as u64
}

fn default_arrival_timeout_ms() -> u64 {
    DEFAULT_ARRIVAL_TIMEOUT.as_millis() as u64
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from(DEFAULT_LOCK_DIR)
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from(DEFAULT_SYSFS_ROOT)
}

impl Parameters {
    pub fn make_parameters(card_id: CardId, channel_number: u32) -> Self {
        Self {
            card_id,
            channel_number,
            card_type: None,
            lock_medium: LockMedium::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
            arrival_timeout_ms: default_arrival_timeout_ms(),
            lock_dir: default_lock_dir(),
            sysfs_root: default_sysfs_root(),
        }
    }

    /// Like `make_parameters`, with `ROC_LOCK_DIR`/`ROC_SYSFS_ROOT` runtime overrides
    pub fn from_env_defaults(card_id: CardId, channel_number: u32) -> Self {
        let mut params = Self::make_parameters(card_id, channel_number);
        if let Ok(dir) = std::env::var("ROC_LOCK_DIR") {
            params.lock_dir = PathBuf::from(dir);
        }
        if let Ok(root) = std::env::var("ROC_SYSFS_ROOT") {
            params.sysfs_root = PathBuf::from(root);
        }
        params
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Parameter(ParameterError::Generic(format!(
                "cannot read {}: {}",
                path.display(),
                e
            )))
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let params: Parameters = serde_json::from_str(text)
            .map_err(|e| Error::Parse(format!("invalid parameters: {}", e)))?;
        params.validate()?;
        Ok(params)
    }

    fn validate(&self) -> Result<()> {
        if !self.lock_dir.is_absolute() {
            return Err(Error::invalid_parameter(format!(
                "lock directory {} must be absolute",
                self.lock_dir.display()
            )));
        }
        if let Some(card_type) = self.card_type {
            card_type.check_channel(self.channel_number)?;
        }
        Ok(())
    }

    pub fn with_card_type(mut self, card_type: CardType) -> Self {
        self.card_type = Some(card_type);
        self
    }

    pub fn with_lock_medium(mut self, medium: LockMedium) -> Self {
        self.lock_medium = medium;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_arrival_timeout(mut self, timeout: Duration) -> Self {
        self.arrival_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    pub fn with_sysfs_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sysfs_root = root.into();
        self
    }

    pub fn card_id(&self) -> &CardId {
        &self.card_id
    }

    pub fn channel_number(&self) -> u32 {
        self.channel_number
    }

    pub fn card_type(&self) -> Option<CardType> {
        self.card_type
    }

    pub fn lock_medium(&self) -> LockMedium {
        self.lock_medium
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn arrival_timeout(&self) -> Duration {
        Duration::from_millis(self.arrival_timeout_ms)
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    pub fn sysfs_root(&self) -> &Path {
        &self.sysfs_root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    #[test]
    fn parses_short_and_full_pci_addresses() {
        let short: PciAddress = "04:00.0".parse().unwrap();
        let full: PciAddress = "0000:04:00.0".parse().unwrap();
        assert_eq!(short, full);
        assert_eq!(short.bus, 4);
        assert_eq!(short.to_string(), "0000:04:00.0");

        let other: PciAddress = "0001:af:1f.7".parse().unwrap();
        assert_eq!((other.domain, other.bus, other.device, other.function), (1, 0xaf, 0x1f, 7));
    }

    #[test]
    fn malformed_ids_are_parse_errors() {
        for text in ["", "04:00", "04.00.0", "04:20.0", "04:00.8", "zz:00.0", "1:2:3:4.0", "#x"] {
            let err = text.parse::<CardId>().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Parse, "input {:?}", text);
        }
    }

    #[test]
    fn card_id_forms() {
        assert_eq!("#2".parse::<CardId>().unwrap(), CardId::Sequence(2));
        let id: CardId = "04:00.0".parse().unwrap();
        assert_eq!(id.to_string(), "0000:04:00.0");
        assert_eq!(CardId::Sequence(0).to_string(), "#0");
    }

    #[test]
    fn channel_numbers_per_generation() {
        assert!(CardType::Crorc.check_channel(5).is_ok());
        assert_eq!(
            CardType::Crorc.check_channel(6).unwrap_err().kind(),
            ErrorKind::InvalidLinkId
        );
        assert!(CardType::Cru.check_channel(2).is_ok());
        assert_eq!(
            CardType::Cru.check_channel(1).unwrap_err().kind(),
            ErrorKind::InvalidLinkId
        );
        assert_eq!(CardType::from_pci_id(0x10dc, 0x0033), Some(CardType::Crorc));
        assert_eq!(CardType::from_pci_id(0x8086, 0x0033), None);
    }

    #[test]
    fn json_parameters_fill_defaults() {
        let params = Parameters::from_json(
            r#"{ "card_id": "04:00.0", "channel_number": 1, "lock_medium": "socket" }"#,
        )
        .unwrap();
        assert_eq!(params.card_id(), &CardId::Pci("04:00.0".parse().unwrap()));
        assert_eq!(params.channel_number(), 1);
        assert_eq!(params.lock_medium(), LockMedium::Socket);
        assert_eq!(params.lock_timeout(), DEFAULT_LOCK_TIMEOUT);
        assert_eq!(params.lock_dir(), Path::new(DEFAULT_LOCK_DIR));
        assert_eq!(params.card_type(), None);
    }

    #[test]
    fn json_parameters_are_validated() {
        let err = Parameters::from_json(r#"{ "card_id": "04:00", "channel_number": 1 }"#)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Parse);

        let err = Parameters::from_json(
            r##"{ "card_id": "#0", "channel_number": 1, "card_type": "cru" }"##,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidLinkId);

        let err = Parameters::from_json(
            r##"{ "card_id": "#0", "channel_number": 0, "lock_dir": "relative/dir" }"##,
        )
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn builder_keeps_values() {
        let params = Parameters::make_parameters(CardId::Sequence(0), 3)
            .with_card_type(CardType::Crorc)
            .with_lock_timeout(Duration::from_millis(250))
            .with_lock_dir("/tmp/roc");
        assert_eq!(params.card_type(), Some(CardType::Crorc));
        assert_eq!(params.lock_timeout(), Duration::from_millis(250));
        assert_eq!(params.lock_dir(), Path::new("/tmp/roc"));
    }

    #[test]
    fn oversized_timeouts_saturate() {
        let params = Parameters::make_parameters(CardId::Sequence(0), 0)
            .with_lock_timeout(Duration::MAX)
            .with_arrival_timeout(Duration::MAX);
        assert_eq!(params.lock_timeout(), Duration::from_millis(u64::MAX));
        assert_eq!(params.arrival_timeout(), Duration::from_millis(u64::MAX));
    }
}
