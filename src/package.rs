//! DFU update-package loading.
//!
//! A package is a ZIP archive with a `manifest.json` naming one firmware
//! image per update target, each split into a raw image (`bin_file`) and a
//! serialized init packet (`dat_file`).

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Seek};
use std::path::Path;
use std::str::FromStr;

use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use zip::ZipArchive;

use crate::error::DfuError;
use crate::init_packet::{HashType, InitPacket};
use crate::protocol::crc32;

/// Firmware image kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FwType {
    Bootloader,
    Softdevice,
    Application,
}

impl FwType {
    /// Transfer order within a combined update.
    pub const SEND_ORDER: [FwType; 3] = [FwType::Bootloader, FwType::Softdevice, FwType::Application];

    pub fn manifest_key(self) -> &'static str {
        match self {
            FwType::Bootloader => "bootloader",
            FwType::Softdevice => "softdevice",
            FwType::Application => "application",
        }
    }

    pub fn from_manifest_key(key: &str) -> Option<FwType> {
        match key {
            "bootloader" => Some(FwType::Bootloader),
            "softdevice" => Some(FwType::Softdevice),
            "application" => Some(FwType::Application),
            _ => None,
        }
    }

    /// `nrf_dfu_firmware_type_t` wire values, as reported in FW_VERSION
    /// responses.
    pub fn from_wire(value: u8) -> Option<FwType> {
        match value {
            0 => Some(FwType::Softdevice),
            1 => Some(FwType::Application),
            2 => Some(FwType::Bootloader),
            _ => None,
        }
    }

    pub fn wire_value(self) -> u8 {
        match self {
            FwType::Softdevice => 0,
            FwType::Application => 1,
            FwType::Bootloader => 2,
        }
    }
}

impl fmt::Display for FwType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.manifest_key())
    }
}

impl FromStr for FwType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FwType::from_manifest_key(&s.to_ascii_lowercase())
            .ok_or_else(|| format!("invalid firmware type: {s}"))
    }
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    bin_file: String,
    dat_file: String,
}

#[derive(Debug, Deserialize)]
struct Manifest {
    manifest: BTreeMap<String, ManifestEntry>,
}

/// One firmware image plus its init packet. Immutable after load.
#[derive(Debug, Clone)]
pub struct Image {
    pub fw_type: FwType,
    pub img_file: String,
    pub init_file: String,
    pub img_data: Vec<u8>,
    pub init_data: Vec<u8>,
    pub init_packet: InitPacket,
}

/// A loaded DFU update package.
#[derive(Debug, Clone)]
pub struct Package {
    images: BTreeMap<FwType, Image>,
}

impl Package {
    pub fn load(path: &Path) -> Result<Package, DfuError> {
        if !path.exists() {
            return Err(DfuError::FileNotSpecified);
        }
        let file = std::fs::File::open(path).map_err(|_| DfuError::FileInvalid)?;
        Package::from_reader(file)
    }

    pub fn from_reader<R: Read + Seek>(reader: R) -> Result<Package, DfuError> {
        let mut zip = ZipArchive::new(reader).map_err(|_| DfuError::FileInvalid)?;

        let manifest: Manifest = {
            let file = zip.by_name("manifest.json").map_err(|_| DfuError::FileInvalid)?;
            serde_json::from_reader(file).map_err(|_| DfuError::FileInvalid)?
        };

        let mut images = BTreeMap::new();
        for (key, entry) in &manifest.manifest {
            let fw_type = FwType::from_manifest_key(key).ok_or(DfuError::FileInvalid)?;
            let img_data = read_member(&mut zip, &entry.bin_file)?;
            let init_data = read_member(&mut zip, &entry.dat_file)?;
            let init_packet = InitPacket::parse(&init_data)?;
            images.insert(
                fw_type,
                Image {
                    fw_type,
                    img_file: entry.bin_file.clone(),
                    init_file: entry.dat_file.clone(),
                    img_data,
                    init_data,
                    init_packet,
                },
            );
        }

        let package = Package { images };
        if package.images.is_empty() {
            return Err(DfuError::FileInvalid);
        }
        // A bootloader + application update cannot be applied without a
        // SoftDevice in the same package.
        if package.has_bootloader() && package.has_app() && !package.has_softdevice() {
            return Err(DfuError::FileInvalid);
        }
        Ok(package)
    }

    pub fn image(&self, fw_type: FwType) -> Option<&Image> {
        self.images.get(&fw_type)
    }

    pub fn images(&self) -> impl Iterator<Item = &Image> {
        self.images.values()
    }

    /// The image kinds present, in transfer order.
    pub fn send_queue(&self) -> Vec<FwType> {
        FwType::SEND_ORDER
            .into_iter()
            .filter(|fw| self.images.contains_key(fw))
            .collect()
    }

    pub fn has_bootloader(&self) -> bool {
        self.images.contains_key(&FwType::Bootloader)
    }

    pub fn has_softdevice(&self) -> bool {
        self.images.contains_key(&FwType::Softdevice)
    }

    pub fn has_app(&self) -> bool {
        self.images.contains_key(&FwType::Application)
    }

    /// Hash of the image bytes, computed with the function the init packet
    /// names. `None` when the packet carries no hash or names `NO_HASH`.
    ///
    /// SHA digests are byte-reversed, matching the SDK convention.
    pub fn firmware_hash(&self, fw_type: FwType) -> Result<Option<Vec<u8>>, DfuError> {
        let image = self.image(fw_type).ok_or(DfuError::FileNotSpecified)?;
        let Some(hash) = &image.init_packet.hash else {
            return Ok(None);
        };
        let digest = match hash.hash_type {
            HashType::NoHash => return Ok(None),
            HashType::Crc => crc32(&image.img_data, 0).to_le_bytes().to_vec(),
            HashType::Sha256 => {
                let mut d: Vec<u8> = Sha256::digest(&image.img_data).to_vec();
                d.reverse();
                d
            }
            HashType::Sha512 => {
                let mut d: Vec<u8> = Sha512::digest(&image.img_data).to_vec();
                d.reverse();
                d
            }
        };
        Ok(Some(digest))
    }
}

fn read_member<R: Read + Seek>(zip: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>, DfuError> {
    let mut member = zip.by_name(name).map_err(|_| DfuError::FileInvalid)?;
    let mut data = Vec::new();
    member
        .read_to_end(&mut data)
        .map_err(|_| DfuError::FileInvalid)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Write};

    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    use super::*;
    use crate::init_packet::wire;

    fn build_zip(entries: &[(&str, &[u8], &[u8])]) -> Cursor<Vec<u8>> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let opts = SimpleFileOptions::default();

        let mut manifest = String::from("{\"manifest\":{");
        for (i, (name, _, _)) in entries.iter().enumerate() {
            if i > 0 {
                manifest.push(',');
            }
            manifest.push_str(&format!(
                "\"{name}\":{{\"bin_file\":\"{name}.bin\",\"dat_file\":\"{name}.dat\",\
                 \"info_read_only_metadata\":{{\"ble_soc_version\":1}}}}"
            ));
        }
        manifest.push_str("}}");

        zip.start_file("manifest.json", opts).unwrap();
        zip.write_all(manifest.as_bytes()).unwrap();
        for (name, bin, dat) in entries {
            zip.start_file(format!("{name}.bin"), opts).unwrap();
            zip.write_all(bin).unwrap();
            zip.start_file(format!("{name}.dat"), opts).unwrap();
            zip.write_all(dat).unwrap();
        }
        let mut cursor = zip.finish().unwrap();
        cursor.set_position(0);
        cursor
    }

    #[test]
    fn loads_application_package() {
        let bin = vec![0xA5u8; 520];
        let dat = wire::init_packet(3, &[0x11; 32], true);
        let zip = build_zip(&[("application", &bin, &dat)]);

        let pkg = Package::from_reader(zip).unwrap();
        assert!(pkg.has_app());
        assert!(!pkg.has_bootloader());
        assert_eq!(pkg.send_queue(), [FwType::Application]);

        let image = pkg.image(FwType::Application).unwrap();
        assert_eq!(image.img_data, bin);
        assert_eq!(image.init_data, dat);
        assert!(image.init_packet.signed);
    }

    #[test]
    fn send_queue_is_ordered() {
        let dat = wire::init_packet(3, &[0x11; 32], false);
        let zip = build_zip(&[
            ("application", b"app", &dat),
            ("softdevice", b"sd", &dat),
            ("bootloader", b"bl", &dat),
        ]);
        let pkg = Package::from_reader(zip).unwrap();
        assert_eq!(
            pkg.send_queue(),
            [FwType::Bootloader, FwType::Softdevice, FwType::Application]
        );
    }

    #[test]
    fn bootloader_with_app_requires_softdevice() {
        let dat = wire::init_packet(3, &[0x11; 32], false);
        let zip = build_zip(&[("application", b"app", &dat), ("bootloader", b"bl", &dat)]);
        assert_eq!(
            Package::from_reader(zip).err(),
            Some(DfuError::FileInvalid)
        );
    }

    #[test]
    fn unknown_manifest_key_rejected() {
        let dat = wire::init_packet(3, &[0x11; 32], false);
        let zip = build_zip(&[("mainboard", b"fw", &dat)]);
        assert_eq!(
            Package::from_reader(zip).err(),
            Some(DfuError::FileInvalid)
        );
    }

    #[test]
    fn missing_manifest_rejected() {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("readme.txt", SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"no manifest here").unwrap();
        let mut cursor = zip.finish().unwrap();
        cursor.set_position(0);
        assert_eq!(
            Package::from_reader(cursor).err(),
            Some(DfuError::FileInvalid)
        );
    }

    #[test]
    fn sha128_package_rejected_at_load() {
        let dat = wire::init_packet(2, &[0x11; 16], false);
        let zip = build_zip(&[("application", b"app", &dat)]);
        assert_eq!(
            Package::from_reader(zip).err(),
            Some(DfuError::FileInvalid)
        );
    }

    #[test]
    fn firmware_hash_crc() {
        let bin = b"firmware image bytes".to_vec();
        let dat = wire::init_packet(1, &[0; 4], false);
        let zip = build_zip(&[("application", &bin, &dat)]);
        let pkg = Package::from_reader(zip).unwrap();

        let hash = pkg.firmware_hash(FwType::Application).unwrap().unwrap();
        assert_eq!(hash, crc32(&bin, 0).to_le_bytes());
    }

    #[test]
    fn firmware_hash_sha256_is_reversed() {
        let bin = vec![0x5Au8; 64];
        let dat = wire::init_packet(3, &[0; 32], false);
        let zip = build_zip(&[("application", &bin, &dat)]);
        let pkg = Package::from_reader(zip).unwrap();

        let hash = pkg.firmware_hash(FwType::Application).unwrap().unwrap();
        let mut expected: Vec<u8> = Sha256::digest(&bin).to_vec();
        expected.reverse();
        assert_eq!(hash, expected);
        // stable across calls
        assert_eq!(
            pkg.firmware_hash(FwType::Application).unwrap().unwrap(),
            hash
        );
    }

    #[test]
    fn firmware_hash_no_hash() {
        let dat = wire::init_packet(0, &[], false);
        let zip = build_zip(&[("application", b"app", &dat)]);
        let pkg = Package::from_reader(zip).unwrap();
        assert_eq!(pkg.firmware_hash(FwType::Application).unwrap(), None);
        assert_eq!(
            pkg.firmware_hash(FwType::Bootloader).err(),
            Some(DfuError::FileNotSpecified)
        );
    }

    #[test]
    fn reload_is_byte_identical() {
        let bin = vec![0xC3u8; 300];
        let dat = wire::init_packet(3, &[0x77; 32], true);
        let zip_bytes = build_zip(&[("application", &bin, &dat)]).into_inner();

        let a = Package::from_reader(Cursor::new(zip_bytes.clone())).unwrap();
        let b = Package::from_reader(Cursor::new(zip_bytes)).unwrap();
        let ia = a.image(FwType::Application).unwrap();
        let ib = b.image(FwType::Application).unwrap();
        assert_eq!(ia.img_data, ib.img_data);
        assert_eq!(ia.init_data, ib.init_data);
    }

    #[test]
    fn fwtype_parsers() {
        assert_eq!("APPLICATION".parse::<FwType>(), Ok(FwType::Application));
        assert_eq!("bootloader".parse::<FwType>(), Ok(FwType::Bootloader));
        assert!("mainboard".parse::<FwType>().is_err());

        assert_eq!(FwType::from_wire(0), Some(FwType::Softdevice));
        assert_eq!(FwType::from_wire(1), Some(FwType::Application));
        assert_eq!(FwType::from_wire(2), Some(FwType::Bootloader));
        assert_eq!(FwType::from_wire(0xFF), None);
        assert_eq!(FwType::Softdevice.wire_value(), 0);
    }
}
