//! Target device descriptors and the device catalog
use std::{
    collections::HashSet,
    fmt,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    constants::MAX_NAME_LEN,
    error::{Error, Result},
};

/// A catalog file, a named collection of supported targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogFile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub devices: Vec<DeviceDescriptor>,
}

/// One of the four fuse bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FuseCategory {
    Lock,
    Low,
    High,
    Extended,
}

impl FuseCategory {
    pub const ALL: [FuseCategory; 4] = [
        FuseCategory::Lock,
        FuseCategory::Low,
        FuseCategory::High,
        FuseCategory::Extended,
    ];
}

impl fmt::Display for FuseCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FuseCategory::Lock => "lock",
            FuseCategory::Low => "low",
            FuseCategory::High => "high",
            FuseCategory::Extended => "extended",
        };
        f.write_str(s)
    }
}

/// One value per fuse category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FuseSet {
    #[serde(deserialize_with = "parse_u8")]
    pub lock: u8,
    #[serde(deserialize_with = "parse_u8")]
    pub low: u8,
    #[serde(deserialize_with = "parse_u8")]
    pub high: u8,
    #[serde(deserialize_with = "parse_u8")]
    pub extended: u8,
}

impl FuseSet {
    pub const fn new(lock: u8, low: u8, high: u8, extended: u8) -> Self {
        FuseSet {
            lock,
            low,
            high,
            extended,
        }
    }

    pub const fn get(&self, category: FuseCategory) -> u8 {
        match category {
            FuseCategory::Lock => self.lock,
            FuseCategory::Low => self.low,
            FuseCategory::High => self.high,
            FuseCategory::Extended => self.extended,
        }
    }

    pub fn set(&mut self, category: FuseCategory, value: u8) {
        match category {
            FuseCategory::Lock => self.lock = value,
            FuseCategory::Low => self.low = value,
            FuseCategory::High => self.high = value,
            FuseCategory::Extended => self.extended = value,
        }
    }
}

impl fmt::Display for FuseSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "lock=0x{:02x} low=0x{:02x} high=0x{:02x} ext=0x{:02x}",
            self.lock, self.low, self.high, self.extended
        )
    }
}

/// Encoding of a firmware payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadFormat {
    /// Intel HEX text records.
    Hex,
    /// Intel HEX records with the delimiters dropped and nibbles merged to bytes.
    Compact,
}

/// Where a descriptor's firmware image lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRef {
    pub path: PathBuf,
    /// Guessed from the file when omitted.
    #[serde(default)]
    pub format: Option<PayloadFormat>,
}

impl PayloadRef {
    pub fn resolve(&self, base: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            base.join(&self.path)
        }
    }
}

/// Represents a supported target and the image flashed onto it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    /// Signature bytes 1 and 2, big endian.
    #[serde(deserialize_with = "parse_u16")]
    pub signature: u16,
    /// Applied before the flash is written.
    pub programming_fuses: FuseSet,
    /// Applied once the flash is written and verified.
    pub normal_fuses: FuseSet,
    /// Flash page size in 16-bit words.
    #[serde(deserialize_with = "parse_u8")]
    pub page_size: u8,
    /// Program memory size in bytes.
    #[serde(default, deserialize_with = "parse_optional_size")]
    pub flash_size: Option<u32>,
    pub payload: PayloadRef,
}

impl ::std::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
        write!(
            f,
            "{}(0x{:02x}{:04x})",
            self.name, crate::constants::ATMEL_VENDOR_CODE, self.signature
        )
    }
}

impl DeviceDescriptor {
    /// Page size in bytes.
    pub const fn page_bytes(&self) -> u32 {
        self.page_size as u32 * 2
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(Error::Catalog(format!(
                "name {:?} must be 1 to {} characters",
                self.name, MAX_NAME_LEN
            )));
        }
        if !self.page_size.is_power_of_two() {
            return Err(Error::Catalog(format!(
                "{}: page size {} is not a power of two",
                self.name, self.page_size
            )));
        }
        if let Some(size) = self.flash_size {
            if size % self.page_bytes() != 0 {
                return Err(Error::Catalog(format!(
                    "{}: flash size {} is not a whole number of pages",
                    self.name, size
                )));
            }
        }
        Ok(())
    }
}

/// Immutable table of supported targets.
#[derive(Debug, Clone)]
pub struct Catalog {
    devices: Vec<DeviceDescriptor>,
}

impl Catalog {
    /// Builds a catalog, rejecting invalid or ambiguous entries.
    pub fn new(devices: Vec<DeviceDescriptor>) -> Result<Self> {
        let mut names = HashSet::new();
        let mut signatures = HashSet::new();
        for device in &devices {
            device.validate()?;
            if !names.insert(device.name.as_str()) {
                return Err(Error::Catalog(format!("duplicate name {:?}", device.name)));
            }
            if !signatures.insert(device.signature) {
                return Err(Error::Catalog(format!(
                    "duplicate signature 0x{:04x} ({})",
                    device.signature, device.name
                )));
            }
        }
        Ok(Catalog { devices })
    }

    /// The catalog shipped with the programmer.
    pub fn builtin() -> Result<Self> {
        Self::from_yaml(include_str!("../devices/robopoly.yaml"))
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let file: CatalogFile =
            serde_yaml::from_str(raw).map_err(|e| Error::Catalog(e.to_string()))?;
        log::debug!("Loaded catalog {}: {} devices", file.name, file.devices.len());
        Self::new(file.devices)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml(&raw)
    }

    pub fn select_image(&self, name: &str) -> Result<&DeviceDescriptor> {
        self.devices
            .iter()
            .find(|d| d.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::Catalog(format!("no image named {:?}", name)))
    }

    pub fn find_by_signature(&self, signature: u16) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.signature == signature)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Number {
    Int(u64),
    Text(String),
}

fn parse_number(raw: Number) -> std::result::Result<u64, String> {
    let s = match raw {
        Number::Int(n) => return Ok(n),
        Number::Text(s) => s,
    };
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16)
    } else if let Some(bin) = s.strip_prefix("0b") {
        u64::from_str_radix(bin, 2)
    } else if let Some(k) = s
        .strip_suffix("KiB")
        .or_else(|| s.strip_suffix("KB"))
        .or_else(|| s.strip_suffix('K'))
    {
        k.parse::<u64>().map(|n| n * 1024)
    } else {
        s.parse()
    };
    parsed.map_err(|e| format!("error while parsing {:?}: {}", s, e))
}

/// Parses an address or length given as `0x` hex, `0b` binary, `K` size
/// or decimal text.
pub fn parse_u32(s: &str) -> std::result::Result<u32, String> {
    let n = parse_number(Number::Text(s.to_string()))?;
    u32::try_from(n).map_err(|_| format!("{} does not fit in 32 bits", s))
}

fn parse_bounded<'de, D>(deserializer: D, max: u64) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Number = Deserialize::deserialize(deserializer)?;
    let n = parse_number(raw).map_err(serde::de::Error::custom)?;
    if n > max {
        return Err(serde::de::Error::custom(format!(
            "value {:#x} out of range (max {:#x})",
            n, max
        )));
    }
    Ok(n)
}

fn parse_u8<'de, D>(deserializer: D) -> std::result::Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    parse_bounded(deserializer, u8::MAX as u64).map(|n| n as u8)
}

fn parse_u16<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    parse_bounded(deserializer, u16::MAX as u64).map(|n| n as u16)
}

fn parse_optional_size<'de, D>(deserializer: D) -> std::result::Result<Option<u32>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    parse_bounded(deserializer, u32::MAX as u64).map(|n| Some(n as u32))
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
name: test
devices:
  - name: blinky
    signature: "0x950f"
    programming_fuses: { lock: "0x3f", low: "0xff", high: "0xde", extended: "0xfd" }
    normal_fuses: { lock: "0x2f", low: "0xff", high: "0xde", extended: "0xfd" }
    page_size: 64
    flash_size: 32K
    payload: { path: blinky.hex, format: hex }
  - name: tiny
    signature: "0x910a"
    programming_fuses: { lock: 63, low: "0xe4", high: "0xdf", extended: "0xff" }
    normal_fuses: { lock: "0x3c", low: "0xe4", high: "0xdf", extended: "0xff" }
    page_size: "16"
    payload: { path: tiny.bin }
"#;

    #[test]
    fn test_load_yaml() {
        let catalog = Catalog::from_yaml(CATALOG).unwrap();
        assert_eq!(catalog.len(), 2);

        let blinky = catalog.select_image("blinky").unwrap();
        assert_eq!(blinky.signature, 0x950f);
        assert_eq!(blinky.page_size, 64);
        assert_eq!(blinky.page_bytes(), 128);
        assert_eq!(blinky.flash_size, Some(32 * 1024));
        assert_eq!(blinky.programming_fuses.get(FuseCategory::Lock), 0x3f);
        assert_eq!(blinky.normal_fuses.get(FuseCategory::Lock), 0x2f);
        assert_eq!(blinky.payload.format, Some(PayloadFormat::Hex));

        let tiny = catalog.find_by_signature(0x910a).unwrap();
        assert_eq!(tiny.name, "tiny");
        assert_eq!(tiny.programming_fuses.lock, 63);
        assert_eq!(tiny.flash_size, None);
        assert_eq!(tiny.payload.format, None);
    }

    #[test]
    fn test_select_unknown_image() {
        let catalog = Catalog::from_yaml(CATALOG).unwrap();
        assert!(matches!(
            catalog.select_image("nope"),
            Err(Error::Catalog(_))
        ));
        assert!(catalog.select_image("BLINKY").is_ok());
    }

    #[test]
    fn test_builtin_signatures_distinct() {
        let catalog = Catalog::builtin().unwrap();
        assert!(!catalog.is_empty());
        let signatures: HashSet<u16> = catalog.iter().map(|d| d.signature).collect();
        assert_eq!(signatures.len(), catalog.len());
    }

    #[test]
    fn test_reject_duplicate_signature() {
        let mut devices: Vec<DeviceDescriptor> =
            Catalog::from_yaml(CATALOG).unwrap().iter().cloned().collect();
        devices[1].signature = devices[0].signature;
        assert!(matches!(Catalog::new(devices), Err(Error::Catalog(_))));
    }

    #[test]
    fn test_reject_bad_page_size() {
        let mut devices: Vec<DeviceDescriptor> =
            Catalog::from_yaml(CATALOG).unwrap().iter().cloned().collect();
        devices[0].page_size = 48;
        assert!(matches!(Catalog::new(devices.clone()), Err(Error::Catalog(_))));
        devices[0].page_size = 0;
        assert!(matches!(Catalog::new(devices), Err(Error::Catalog(_))));
    }

    #[test]
    fn test_reject_long_name() {
        let mut devices: Vec<DeviceDescriptor> =
            Catalog::from_yaml(CATALOG).unwrap().iter().cloned().collect();
        devices[0].name = "a-name-far-too-long".into();
        assert!(matches!(Catalog::new(devices), Err(Error::Catalog(_))));
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number(Number::Text("0x1f".into())), Ok(0x1f));
        assert_eq!(parse_number(Number::Text("0b101".into())), Ok(5));
        assert_eq!(parse_number(Number::Text("2K".into())), Ok(2048));
        assert_eq!(parse_number(Number::Text("256KiB".into())), Ok(256 * 1024));
        assert_eq!(parse_number(Number::Int(42)), Ok(42));
        assert!(parse_number(Number::Text("zz".into())).is_err());
        assert_eq!(parse_u32("0x100"), Ok(0x100));
        assert_eq!(parse_u32("256"), Ok(256));
        assert!(parse_u32("0x100000000").is_err());
    }
}
