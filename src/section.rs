use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::{
    error::{FfsError, FfsResult},
    flash_dev::FlashDevice,
    FILE_NODE_SIZE, SECTOR_HEADER_SIZE,
};

/// One contiguous range of sectors on a physical flash part that the
/// file system is allowed to manage.
pub struct FlashSection {
    /// Device number, for diagnostics only.
    pub device: u8,
    /// First physical sector of the range, relative to the part.
    pub start: u32,
    /// Number of sectors in this section.
    pub count: u32,
    /// Size in bytes of each sector in this section.
    pub sector_size: u32,
    /// Read/write/erase primitives for this section.
    pub flash: Arc<dyn FlashDevice>,
}

/// Registry of managed flash sections.
///
/// Logical sector numbers run consecutively across all sections in
/// table order; all physical I/O goes through here.
pub struct SectionTable {
    sections: Vec<FlashSection>,
    total_sectors: u32,
}

impl SectionTable {
    pub fn new(sections: Vec<FlashSection>) -> Self {
        for section in &sections {
            assert!(
                section.sector_size as usize > SECTOR_HEADER_SIZE + FILE_NODE_SIZE,
                "Sector size must hold a header and a filenode."
            );
        }
        let total_sectors = sections.iter().map(|s| s.count).sum();
        Self {
            sections,
            total_sectors,
        }
    }

    pub fn sections(&self) -> &[FlashSection] {
        &self.sections
    }

    /// Total sector count across every section.
    pub fn total_sectors(&self) -> u32 {
        self.total_sectors
    }

    /// Map a logical sector number to its section and the sector
    /// number relative to that section.
    /// # Return
    /// * None if the number is past the end of the table.
    pub fn resolve(&self, sector: u32) -> Option<(&FlashSection, u32)> {
        let mut remaining = sector;
        for section in &self.sections {
            if remaining < section.count {
                return Some((section, remaining));
            }
            remaining -= section.count;
        }
        None
    }

    pub fn is_valid(&self, sector: u32) -> bool {
        sector < self.total_sectors
    }

    /// Sector size of the section holding a logical sector.
    pub fn sector_size(&self, sector: u32) -> FfsResult<u32> {
        self.resolve(sector)
            .map(|(section, _)| section.sector_size)
            .ok_or(FfsError::InvalidSectorNumber)
    }

    /// Read part of a logical sector.
    pub fn read_sector(&self, sector: u32, offset: usize, buf: &mut [u8]) -> FfsResult<()> {
        let (section, rel) = self
            .resolve(sector)
            .ok_or(FfsError::InvalidSectorNumber)?;
        section.flash.read(rel, offset, buf)
    }

    /// Write part of a logical sector. The write may only clear bits
    /// unless the sector was erased first.
    pub fn write_sector(&self, sector: u32, offset: usize, buf: &[u8]) -> FfsResult<()> {
        let (section, rel) = self
            .resolve(sector)
            .ok_or(FfsError::InvalidSectorNumber)?;
        section.flash.write(rel, offset, buf)
    }

    /// Erase a logical sector, restoring every bit to one.
    pub fn erase_sector(&self, sector: u32) -> FfsResult<()> {
        let (section, rel) = self
            .resolve(sector)
            .ok_or(FfsError::InvalidSectorNumber)?;
        section.flash.erase(rel)
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::test_util::RamFlash;

    fn two_section_table() -> SectionTable {
        SectionTable::new(vec![
            FlashSection {
                device: 0,
                start: 0,
                count: 4,
                sector_size: 256,
                flash: RamFlash::new(4, 256),
            },
            FlashSection {
                device: 1,
                start: 0,
                count: 3,
                sector_size: 512,
                flash: RamFlash::new(3, 512),
            },
        ])
    }

    #[test]
    fn resolve_walks_sections_in_order() {
        let table = two_section_table();
        assert_eq!(table.total_sectors(), 7);

        let (section, rel) = table.resolve(0).unwrap();
        assert_eq!((section.device, rel), (0, 0));
        let (section, rel) = table.resolve(3).unwrap();
        assert_eq!((section.device, rel), (0, 3));
        let (section, rel) = table.resolve(4).unwrap();
        assert_eq!((section.device, rel), (1, 0));
        let (section, rel) = table.resolve(6).unwrap();
        assert_eq!((section.device, rel), (1, 2));
        assert!(table.resolve(7).is_none());
    }

    #[test]
    fn out_of_range_sector_is_rejected() {
        let table = two_section_table();
        let mut buf = [0u8; 4];
        assert!(!table.is_valid(7));
        assert_eq!(
            table.read_sector(7, 0, &mut buf),
            Err(FfsError::InvalidSectorNumber)
        );
        assert_eq!(
            table.write_sector(100, 0, &buf),
            Err(FfsError::InvalidSectorNumber)
        );
        assert_eq!(table.erase_sector(7), Err(FfsError::InvalidSectorNumber));
    }

    #[test]
    fn device_errors_pass_through_unchanged() {
        struct FailingFlash;
        impl FlashDevice for FailingFlash {
            fn read(&self, _sector: u32, _offset: usize, _buf: &mut [u8]) -> FfsResult<()> {
                Err(FfsError::Device(-42))
            }
            fn write(&self, _sector: u32, _offset: usize, _buf: &[u8]) -> FfsResult<()> {
                Err(FfsError::Device(-43))
            }
            fn erase(&self, _sector: u32) -> FfsResult<()> {
                Err(FfsError::Device(-44))
            }
        }

        let table = SectionTable::new(vec![FlashSection {
            device: 0,
            start: 0,
            count: 2,
            sector_size: 256,
            flash: Arc::new(FailingFlash),
        }]);
        let mut buf = [0u8; 4];
        assert_eq!(table.read_sector(0, 0, &mut buf), Err(FfsError::Device(-42)));
        assert_eq!(table.write_sector(0, 0, &buf), Err(FfsError::Device(-43)));
        assert_eq!(table.erase_sector(1), Err(FfsError::Device(-44)));
    }

    #[test]
    fn io_reaches_the_owning_section() {
        let table = two_section_table();
        // Sector 5 lives in the second section; erased flash reads as ones.
        table.erase_sector(5).unwrap();
        let mut buf = [0u8; 4];
        table.read_sector(5, 100, &mut buf).unwrap();
        assert_eq!(buf, [0xff; 4]);

        table.write_sector(5, 100, &[0x12, 0x34, 0x56, 0x78]).unwrap();
        table.read_sector(5, 100, &mut buf).unwrap();
        assert_eq!(buf, [0x12, 0x34, 0x56, 0x78]);
    }
}
