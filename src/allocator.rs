use log::debug;

use crate::{
    error::{FfsError, FfsResult},
    layout::{SectorHeader, SectorStatus},
    section::SectionTable,
    SECTOR_KEY, SECTOR_NONE,
};

/// Finds and formats free sectors and marks released chains dirty for
/// a later erase.
///
/// Allocation scans sectors in ascending order; a sector counts as
/// free if its header carries a valid key with FREE or FREE_DIRTY
/// status, or if the key is invalid (a never-formatted sector, which
/// is still usable after an erase).
pub struct SectorAllocator {
    /// High-water mark of invalid-key sectors seen in one scan.
    error_sectors: u32,
}

impl SectorAllocator {
    pub const fn new() -> Self {
        Self { error_sectors: 0 }
    }

    pub fn error_sectors(&self) -> u32 {
        self.error_sectors
    }

    pub fn reset_errors(&mut self) {
        self.error_sectors = 0;
    }

    /// Scan for the first allocatable sector.
    /// # Return
    /// * (sector number, its current header, its sector size), or
    ///   None when every sector is in use.
    fn find_free(&mut self, table: &SectionTable) -> FfsResult<Option<(u32, SectorHeader, u32)>> {
        let mut bad_headers = 0;
        for sector in 0..table.total_sectors() {
            let header = SectorHeader::read_from(table, sector)?;
            if header.key == SECTOR_KEY {
                if matches!(
                    header.status(),
                    Some(SectorStatus::Free) | Some(SectorStatus::FreeDirty)
                ) {
                    let size = table.sector_size(sector)?;
                    return Ok(Some((sector, header, size)));
                }
            } else {
                // No valid header: count it, but press it into service
                // anyway. The erase below makes it usable.
                bad_headers += 1;
                if bad_headers > self.error_sectors {
                    self.error_sectors = bad_headers;
                }
                debug!("sector {} has no valid header, treating as free", sector);
                let size = table.sector_size(sector)?;
                return Ok(Some((sector, header, size)));
            }
        }
        Ok(None)
    }

    /// Allocate one sector: find a free one, erase it, and write a
    /// fresh header. With `with_filenode`, data starts after the
    /// header and a filenode; otherwise right after the header.
    /// # Return
    /// * The sector number and a copy of its new header.
    pub fn allocate(
        &mut self,
        table: &SectionTable,
        with_filenode: bool,
    ) -> FfsResult<(u32, SectorHeader)> {
        let (sector, mut header, sector_size) = match self.find_free(table)? {
            Some(found) => found,
            None => return Err(FfsError::OutOfSpace),
        };
        let status = if with_filenode {
            SectorStatus::InUseFilenode
        } else {
            SectorStatus::InUse
        };
        header.initialize(status, sector_size);
        table.erase_sector(sector)?;
        header.write_to(table, sector)?;
        debug!(
            "allocated sector {} (erase count {})",
            sector, header.erase_count
        );
        Ok((sector, header))
    }

    /// Logically free one sector by clearing its status byte to
    /// FREE_DIRTY. Only that byte is written; physical erase happens
    /// on reuse.
    pub fn mark_free_dirty(&self, table: &SectionTable, sector: u32) -> FfsResult<()> {
        table.write_sector(
            sector,
            SectorHeader::STATUS_OFFSET,
            &[SectorStatus::FreeDirty as u8],
        )
    }

    /// Walk a file's chain from its head sector and mark every sector
    /// FREE_DIRTY.
    /// # Return
    /// * The number of sectors freed.
    pub fn free_chain(&self, table: &SectionTable, head: u32) -> FfsResult<u32> {
        let mut sector = head;
        let mut freed = 0;
        while sector != SECTOR_NONE && table.is_valid(sector) {
            let header = SectorHeader::read_from(table, sector)?;
            self.mark_free_dirty(table, sector)?;
            freed += 1;
            sector = header.next;
        }
        debug!("freed {} sectors starting at {}", freed, head);
        Ok(freed)
    }
}
