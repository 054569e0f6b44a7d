//! Image files.
//!
//! An image is the eight word master memory record followed by the bytes
//! of every segment from `romStart` to the end of RAM. The record is
//! written in the byte order of the object data; a reversed magic number
//! on load means the image is little-endian.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::config::VmSettings;
use crate::error::ImageError;
use crate::header;
use crate::heap::{ObjectMemory, SegmentRange};
use crate::layout::*;
use crate::memory::{Endian, Memory};

fn write_word<W: Write>(w: &mut W, endian: Endian, value: u32) -> Result<(), ImageError> {
    match endian {
        Endian::Big => w.write_u32::<BigEndian>(value)?,
        Endian::Little => w.write_u32::<LittleEndian>(value)?,
    }
    Ok(())
}

fn read_word<R: Read>(r: &mut R, endian: Endian) -> Result<u32, ImageError> {
    let value = match endian {
        Endian::Big => r.read_u32::<BigEndian>()?,
        Endian::Little => r.read_u32::<LittleEndian>()?,
    };
    Ok(value)
}

pub fn write_image<W: Write>(om: &ObjectMemory, w: &mut W) -> Result<(), ImageError> {
    let endian = om.mem.endian();
    let rom = om.segment(Segment::Rom);
    let eeprom = om.segment(Segment::Eeprom);
    let ram = om.segment(Segment::Ram);
    let record = [
        MMR_MAGIC,
        MMR_VERSION,
        rom.start,
        rom.size,
        eeprom.start,
        eeprom.size,
        ram.start,
        ram.size,
    ];
    debug_assert_eq!(record.len(), MMR_SIZE);
    for word in record {
        write_word(w, endian, word)?;
    }
    w.write_all(om.mem.slice(rom.start, ram.end() - rom.start))?;
    Ok(())
}

pub fn save_image(om: &ObjectMemory, path: &Path) -> Result<(), ImageError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_image(om, &mut writer)?;
    writer.flush()?;
    log::info!(
        target: "squawk::image",
        "wrote {} ({} bytes)",
        path.display(),
        om.segment(Segment::Ram).end() - om.segment(Segment::Rom).start
    );
    Ok(())
}

fn check_layout(rom: SegmentRange, eeprom: SegmentRange, ram: SegmentRange) -> Result<(), ImageError> {
    if rom.start == 0 {
        return Err(ImageError::Layout("ROM starts at address 0"));
    }
    if [rom, eeprom, ram].iter().any(|s| s.size < MSR_BYTES) {
        return Err(ImageError::Layout("segment smaller than its segment record"));
    }
    if [rom, eeprom, ram].iter().any(|s| s.start % 4 != 0 || s.size % 4 != 0) {
        return Err(ImageError::Layout("segment is not word aligned"));
    }
    if rom.end() > eeprom.start || eeprom.end() > ram.start {
        return Err(ImageError::Layout("segments overlap or are out of order"));
    }
    if ram.end() > header::CLASS_MASK {
        return Err(ImageError::Layout("image exceeds the 24 bit address space"));
    }
    Ok(())
}

pub fn read_image<R: Read>(r: &mut R, settings: &VmSettings) -> Result<ObjectMemory, ImageError> {
    let magic = r.read_u32::<BigEndian>()?;
    let endian = match magic {
        MMR_MAGIC => Endian::Big,
        MMR_MAGIC_REVERSED => Endian::Little,
        other => return Err(ImageError::BadMagic(other)),
    };
    let mut record = [0u32; MMR_SIZE];
    record[MMR_MAGIC_NUMBER] = MMR_MAGIC;
    for word in record.iter_mut().skip(1) {
        *word = read_word(r, endian)?;
    }
    if record[MMR_VERSION_WORD] != MMR_VERSION {
        return Err(ImageError::BadVersion(record[MMR_VERSION_WORD]));
    }
    let rom = SegmentRange::new(record[MMR_ROM_START], record[MMR_ROM_SIZE]);
    let eeprom = SegmentRange::new(record[MMR_EEPROM_START], record[MMR_EEPROM_SIZE]);
    let ram = SegmentRange::new(record[MMR_RAM_START], record[MMR_RAM_SIZE]);
    check_layout(rom, eeprom, ram)?;

    let expected = (ram.end() - rom.start) as usize;
    let mut bytes = Vec::with_capacity(expected);
    r.take(expected as u64).read_to_end(&mut bytes)?;
    if bytes.len() != expected {
        return Err(ImageError::Truncated {
            expected,
            found: bytes.len(),
        });
    }
    let mut mem = Memory::new(ram.end(), endian);
    mem.slice_mut(rom.start, expected as u32).copy_from_slice(&bytes);
    log::debug!(
        target: "squawk::image",
        "{endian:?} image: ROM {:#x}+{:#x}, EEPROM {:#x}+{:#x}, RAM {:#x}+{:#x}",
        rom.start,
        rom.size,
        eeprom.start,
        eeprom.size,
        ram.start,
        ram.size
    );
    Ok(ObjectMemory::new(mem, rom, eeprom, ram, settings))
}

pub fn load_image(path: &Path, settings: &VmSettings) -> Result<ObjectMemory, ImageError> {
    let mut reader = BufReader::new(File::open(path)?);
    let om = read_image(&mut reader, settings)?;
    log::info!(target: "squawk::image", "loaded {}", path.display());
    Ok(om)
}

/// `<base><n>.image`
pub fn checkpoint_path(base: &Path, n: u32) -> PathBuf {
    let mut name = base.as_os_str().to_owned();
    name.push(format!("{n}.image"));
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::cno;
    use crate::romizer::RomBuilder;

    fn create_test_image(endian: Endian) -> ObjectMemory {
        RomBuilder::new()
            .with_endian(endian)
            .build_object_memory(0x800, 0x2000, &VmSettings::default())
    }

    fn create_test_bytes(om: &ObjectMemory) -> Vec<u8> {
        let mut bytes = Vec::new();
        write_image(om, &mut bytes).unwrap();
        bytes
    }

    #[test]
    fn big_endian_round_trip() {
        let om = create_test_image(Endian::Big);
        let bytes = create_test_bytes(&om);
        assert_eq!(&bytes[..4], &MMR_MAGIC.to_be_bytes());

        let loaded = read_image(&mut bytes.as_slice(), &VmSettings::default()).unwrap();
        assert_eq!(loaded.mem.endian(), Endian::Big);
        for seg in Segment::ALL {
            assert_eq!(loaded.segment(seg), om.segment(seg));
        }
        assert_eq!(loaded.mem.as_bytes(), om.mem.as_bytes());
        assert_eq!(loaded.class_from_cno(cno::OBJECT_ARRAY), om.class_from_cno(cno::OBJECT_ARRAY));
    }

    #[test]
    fn reversed_magic_means_little_endian() {
        let om = create_test_image(Endian::Little);
        let bytes = create_test_bytes(&om);
        assert_eq!(&bytes[..4], &MMR_MAGIC.to_le_bytes());
        assert_eq!(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]), MMR_MAGIC_REVERSED);

        let loaded = read_image(&mut bytes.as_slice(), &VmSettings::default()).unwrap();
        assert_eq!(loaded.mem.endian(), Endian::Little);
        assert_eq!(loaded.segment(Segment::Ram), om.segment(Segment::Ram));
        assert_eq!(loaded.class_from_cno(cno::THREAD), om.class_from_cno(cno::THREAD));
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let om = create_test_image(Endian::Big);
        let mut bytes = create_test_bytes(&om);
        bytes[0] ^= 0xFF;
        assert!(matches!(
            read_image(&mut bytes.as_slice(), &VmSettings::default()),
            Err(ImageError::BadMagic(_))
        ));

        let mut bytes = create_test_bytes(&om);
        bytes[4..8].copy_from_slice(&99u32.to_be_bytes());
        assert!(matches!(
            read_image(&mut bytes.as_slice(), &VmSettings::default()),
            Err(ImageError::BadVersion(99))
        ));
    }

    #[test]
    fn truncated_images_are_rejected() {
        let om = create_test_image(Endian::Big);
        let mut bytes = create_test_bytes(&om);
        bytes.truncate(bytes.len() - 10);
        match read_image(&mut bytes.as_slice(), &VmSettings::default()) {
            Err(ImageError::Truncated { expected, found }) => assert_eq!(expected - found, 10),
            other => panic!("expected truncation, got {:?}", other.err()),
        }
    }

    #[test]
    fn overlapping_segments_are_rejected() {
        let om = create_test_image(Endian::Big);
        let mut bytes = create_test_bytes(&om);
        let rom_start = om.segment(Segment::Rom).start;
        bytes[MMR_EEPROM_START * 4..MMR_EEPROM_START * 4 + 4].copy_from_slice(&rom_start.to_be_bytes());
        assert!(matches!(
            read_image(&mut bytes.as_slice(), &VmSettings::default()),
            Err(ImageError::Layout(_))
        ));
    }

    #[test]
    fn checkpoint_names_count_up() {
        assert_eq!(checkpoint_path(Path::new("out/run"), 3), PathBuf::from("out/run3.image"));
    }
}
