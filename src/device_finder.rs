//! Card enumeration through sysfs
//!
//! Scans the PCI device directory, keeps the devices whose vendor/device ids
//! belong to a supported card generation and resolves a [`CardId`] to one of
//! them. Sequence numbers count supported cards in address order.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::parameters::{CardId, CardType, PciAddress};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardDescriptor {
    pub card_type: CardType,
    pub address: PciAddress,
    pub sequence: u32,
    pub path: PathBuf,
}

impl CardDescriptor {
    /// sysfs resource file of a BAR
    pub fn bar_resource(&self, bar: u32) -> PathBuf {
        self.path.join(format!("resource{}", bar))
    }
}

pub struct DeviceFinder {
    root: PathBuf,
}

impl DeviceFinder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn find_cards(&self) -> Result<Vec<CardDescriptor>> {
        let entries = std::fs::read_dir(&self.root).map_err(|e| {
            Error::DeviceFinder(format!("cannot list {}: {}", self.root.display(), e))
        })?;

        let mut devices: Vec<(PciAddress, PathBuf)> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let name = entry.file_name();
                let address = name.to_str()?.parse::<PciAddress>().ok()?;
                Some((address, entry.path()))
            })
            .collect();
        devices.sort_by_key(|(address, _)| address.to_string());

        let mut cards = Vec::new();
        for (address, path) in devices {
            let card_type = match read_id(&path.join("vendor"))
                .zip(read_id(&path.join("device")))
                .and_then(|(vendor, device)| CardType::from_pci_id(vendor, device))
            {
                Some(card_type) => card_type,
                None => continue,
            };
            tracing::debug!("Found {} at {}", card_type, address);
            cards.push(CardDescriptor {
                card_type,
                address,
                sequence: cards.len() as u32,
                path,
            });
        }
        Ok(cards)
    }

    pub fn find(&self, id: &CardId) -> Result<CardDescriptor> {
        let cards = self.find_cards()?;
        let found = match id {
            CardId::Pci(address) => cards.into_iter().find(|c| c.address == *address),
            CardId::Sequence(n) => cards.into_iter().find(|c| c.sequence == *n),
        };
        found.ok_or_else(|| {
            Error::DeviceFinder(format!(
                "no supported card with id {} under {}",
                id,
                self.root.display()
            ))
        })
    }
}

/// Read a `0x`-prefixed hex id file such as `vendor`
fn read_id(path: &Path) -> Option<u16> {
    let text = std::fs::read_to_string(path).ok()?;
    let text = text.trim();
    u16::from_str_radix(text.strip_prefix("0x").unwrap_or(text), 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;

    fn add_device(root: &Path, address: &str, vendor: u16, device: u16) {
        let dir = root.join(address);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("vendor"), format!("{:#06x}\n", vendor)).unwrap();
        std::fs::write(dir.join("device"), format!("{:#06x}\n", device)).unwrap();
    }

    fn sysfs() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        add_device(root.path(), "0000:00:1f.3", 0x8086, 0xa348);
        add_device(root.path(), "0000:81:00.0", 0x1172, 0xe001);
        add_device(root.path(), "0000:04:00.0", 0x10dc, 0x0033);
        std::fs::create_dir_all(root.path().join("not-a-device")).unwrap();
        root
    }

    #[test]
    fn lists_supported_cards_in_address_order() {
        let root = sysfs();
        let cards = DeviceFinder::new(root.path()).find_cards().unwrap();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[0].card_type, CardType::Crorc);
        assert_eq!(cards[0].sequence, 0);
        assert_eq!(cards[1].card_type, CardType::Cru);
        assert_eq!(cards[1].address.to_string(), "0000:81:00.0");
        assert_eq!(
            cards[1].bar_resource(2),
            root.path().join("0000:81:00.0").join("resource2")
        );
    }

    #[test]
    fn resolves_by_address_and_sequence() {
        let root = sysfs();
        let finder = DeviceFinder::new(root.path());
        let card = finder.find(&"04:00.0".parse().unwrap()).unwrap();
        assert_eq!(card.card_type, CardType::Crorc);
        let card = finder.find(&CardId::Sequence(1)).unwrap();
        assert_eq!(card.card_type, CardType::Cru);
    }

    #[test]
    fn unknown_card_is_device_finder_error() {
        let root = sysfs();
        let finder = DeviceFinder::new(root.path());
        let err = finder.find(&"00:1f.3".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceFinder);
        let err = finder.find(&CardId::Sequence(2)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceFinder);

        let err = DeviceFinder::new("/nonexistent/sysfs").find_cards().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceFinder);
    }
}
