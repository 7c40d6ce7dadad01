use alloc::vec;
use bitflags::bitflags;
use log::{info, warn};

use crate::{
    error::FfsResult,
    ffs::FlashFileSystem,
    layout::{FileNode, SectorHeader, SectorStatus},
    SECTOR_KEY, SECTOR_NONE,
};

bitflags! {
    /// Transient per-sector marks used while checking.
    struct CheckMark: u8 {
        const BAD   = 0x01;
        const FNODE = 0x02;
        const FREE  = 0x04;
        const INUSE = 0x08;
    }
}

impl FlashFileSystem {
    /// Check the file system and repair power-loss damage: orphaned
    /// chains go back to the free pool, half-created files are erased,
    /// and duplicate names are resolved in favor of the higher
    /// creation count. A second run right after finds nothing to fix.
    /// # Return
    /// * Number of sectors fixed.
    pub fn check(&mut self) -> FfsResult<u32> {
        self.total_cross_chain = 0;
        self.allocator.reset_errors();

        let total = self.table.total_sectors();
        let mut marks = vec![CheckMark::empty(); total as usize];
        let mut fixed = 0u32;

        // Pass A: classify every sector; each filenode's chain claims
        // the sectors it links.
        for sector in 0..total {
            let header = SectorHeader::read_from(&self.table, sector)?;
            let status = header.status();
            if header.key != SECTOR_KEY
                && status != Some(SectorStatus::Free)
                && status != Some(SectorStatus::FreeDirty)
            {
                marks[sector as usize] |= CheckMark::BAD;
            }
            match status {
                Some(SectorStatus::Free) | Some(SectorStatus::FreeDirty) => {
                    marks[sector as usize] |= CheckMark::FREE;
                }
                Some(SectorStatus::InUse) => {}
                Some(SectorStatus::InUseFilenode) => {
                    let fnode = FileNode::read_from(&self.table, sector)?;
                    if fnode.file_size == 0 || fnode.file_size == SECTOR_NONE {
                        // A create that never reached close.
                        marks[sector as usize] |= CheckMark::BAD;
                    } else {
                        marks[sector as usize] |= CheckMark::FNODE;
                        self.claim_chain(header.next, &mut marks)?;
                    }
                }
                None => {}
            }
        }

        // Pass B: a sector that is neither claimed, a head, nor free
        // is either damaged (erase it) or orphaned (free it).
        for sector in 0..total {
            let mark = marks[sector as usize];
            if mark.intersects(CheckMark::INUSE | CheckMark::FNODE | CheckMark::FREE) {
                continue;
            }
            if mark.contains(CheckMark::BAD) {
                self.table.erase_sector(sector)?;
            } else {
                self.allocator.mark_free_dirty(&self.table, sector)?;
            }
            fixed += 1;
        }

        // Pass C: duplicate names from an interrupted replacement.
        // The lower creation count loses its whole chain.
        for sector in 0..total {
            let header = SectorHeader::read_from(&self.table, sector)?;
            if header.status() != Some(SectorStatus::InUseFilenode) {
                continue;
            }
            let fnode = FileNode::read_from(&self.table, sector)?;
            for other in sector + 1..total {
                let other_header = SectorHeader::read_from(&self.table, other)?;
                if other_header.status() != Some(SectorStatus::InUseFilenode) {
                    continue;
                }
                let other_fnode = FileNode::read_from(&self.table, other)?;
                if !fnode
                    .name_bytes()
                    .eq_ignore_ascii_case(other_fnode.name_bytes())
                {
                    continue;
                }
                let loser = if fnode.count < other_fnode.count {
                    sector
                } else {
                    other
                };
                warn!(
                    "duplicate name in sectors {} and {}, freeing {}",
                    sector, other, loser
                );
                fixed += self.allocator.free_chain(&self.table, loser)?;
                if loser == sector {
                    break;
                }
            }
        }

        if fixed > 0 || self.total_cross_chain > 0 {
            warn!(
                "check fixed {} sectors, {} cross-chained",
                fixed, self.total_cross_chain
            );
        } else {
            info!("check found a clean file system");
        }
        Ok(fixed)
    }

    /// Follow the Next links from a head sector, marking each linked
    /// sector as claimed and counting collisions with sectors already
    /// spoken for. Stops at the sentinel, at an out-of-range link, or
    /// at a sector some chain already claimed, so a corrupted cycle
    /// terminates.
    fn claim_chain(&mut self, first: u32, marks: &mut [CheckMark]) -> FfsResult<()> {
        let mut next = first;
        while next != SECTOR_NONE {
            if !self.table.is_valid(next) {
                break;
            }
            let idx = next as usize;
            if marks[idx].intersects(CheckMark::FREE | CheckMark::FNODE | CheckMark::BAD) {
                self.total_cross_chain += 1;
            }
            if marks[idx].contains(CheckMark::INUSE) {
                self.total_cross_chain += 1;
                break;
            }
            marks[idx] |= CheckMark::INUSE;
            let header = SectorHeader::read_from(&self.table, next)?;
            next = header.next;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::FfsError;
    use crate::ffs::{FileDescriptor, OpenFlags, SpaceOption};
    use crate::layout::{SectorHeader, SectorStatus};
    use crate::test_util::{list, mounted, pattern, read_file, write_file};

    const SECTOR_SIZE: u32 = 256;

    #[test]
    fn clean_medium_needs_no_fixes() {
        let fs = mounted(8, SECTOR_SIZE);
        write_file(&fs, "a", b"aa");
        write_file(&fs, "b", &pattern(300));
        assert_eq!(fs.lock().check(), Ok(0));
        assert_eq!(fs.lock().cross_chain_count(), 0);
    }

    #[test]
    fn orphaned_sectors_are_reclaimed() {
        let fs = mounted(8, SECTOR_SIZE);
        {
            let mut guard = fs.lock();
            let inner = &mut *guard;
            // An in-use sector no chain refers to.
            inner.allocator.allocate(&inner.table, false).unwrap();
        }
        assert_eq!(fs.lock().space(SpaceOption::FreeSectors), Ok(7));

        assert_eq!(fs.lock().check(), Ok(1));
        assert_eq!(fs.lock().space(SpaceOption::FreeSectors), Ok(8));
        // Second run has nothing left to do.
        assert_eq!(fs.lock().check(), Ok(0));
    }

    #[test]
    fn interrupted_create_is_erased() {
        let fs = mounted(8, SECTOR_SIZE);
        {
            let mut guard = fs.lock();
            let fd = guard
                .open("wip", OpenFlags::CREATE | OpenFlags::WRONLY, 0)
                .unwrap();
            guard.write(fd, &pattern(300)).unwrap();
            // Power loss before close: the descriptor evaporates and
            // the filenode was never written.
            guard.descriptors[fd] = FileDescriptor::EMPTY;
        }

        assert_eq!(list(&fs).len(), 1); // shows as "[New File]"
        // Head (bad filenode) erased, tail sector freed.
        assert_eq!(fs.lock().check(), Ok(2));
        assert!(list(&fs).is_empty());
        assert_eq!(fs.lock().space(SpaceOption::FreeSectors), Ok(8));
        assert_eq!(fs.lock().check(), Ok(0));
    }

    #[test]
    fn interrupted_replace_keeps_the_newer_version() {
        let fs = mounted(8, SECTOR_SIZE);
        write_file(&fs, "A", b"old contents");

        {
            let mut guard = fs.lock();
            let fd = guard
                .open("A", OpenFlags::CREATE | OpenFlags::WRONLY, 0)
                .unwrap();
            guard.write(fd, b"new").unwrap();
            // Interrupt close between the filenode write and the
            // release of the old chain.
            let inner = &mut *guard;
            let sector = inner.descriptors[fd].fnode_sector.unwrap();
            inner.descriptors[fd].fnode.write_to(&inner.table, sector).unwrap();
            inner.descriptors[fd] = FileDescriptor::EMPTY;
        }

        // Both generations are on the medium.
        assert_eq!(list(&fs).len(), 2);

        let fixed = fs.lock().check().unwrap();
        assert!(fixed >= 1);
        let entries = list(&fs);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "A");
        assert_eq!(entries[0].2, 1);
        assert_eq!(read_file(&fs, "A"), b"new");
        assert_eq!(fs.lock().check(), Ok(0));
    }

    #[test]
    fn duplicate_resolution_prefers_higher_count_regardless_of_order() {
        let fs = mounted(8, SECTOR_SIZE);
        // Generation 1 ends up in an earlier sector than generation 0:
        // write v0, start the replacement, then free v0's head last.
        write_file(&fs, "f", b"version zero");
        {
            let mut guard = fs.lock();
            let fd = guard
                .open("f", OpenFlags::CREATE | OpenFlags::WRONLY, 0)
                .unwrap();
            guard.write(fd, b"version one").unwrap();
            let inner = &mut *guard;
            let sector = inner.descriptors[fd].fnode_sector.unwrap();
            inner.descriptors[fd].fnode.write_to(&inner.table, sector).unwrap();
            inner.descriptors[fd] = FileDescriptor::EMPTY;
        }

        fs.lock().check().unwrap();
        assert_eq!(read_file(&fs, "f"), b"version one");

        // Now the survivor (count 1) sits in a later sector than a
        // fresh create would land; crash another replacement so the
        // lower count occupies the earlier sector.
        {
            let mut guard = fs.lock();
            let fd = guard
                .open("f", OpenFlags::CREATE | OpenFlags::WRONLY, 0)
                .unwrap();
            guard.write(fd, b"version two").unwrap();
            let inner = &mut *guard;
            let sector = inner.descriptors[fd].fnode_sector.unwrap();
            inner.descriptors[fd].fnode.write_to(&inner.table, sector).unwrap();
            inner.descriptors[fd] = FileDescriptor::EMPTY;
        }
        fs.lock().check().unwrap();
        assert_eq!(read_file(&fs, "f"), b"version two");
        let entries = list(&fs);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].2, 2);
    }

    #[test]
    fn cross_chained_sectors_are_counted() {
        let fs = mounted(8, SECTOR_SIZE);
        write_file(&fs, "a", &pattern(300)); // sectors 0 (head) and 1
        write_file(&fs, "b", b"bb"); // sector 2

        {
            // Corrupt b's chain to point into a's tail.
            let guard = fs.lock();
            let next: u32 = 1;
            guard
                .table
                .write_sector(2, SectorHeader::NEXT_OFFSET, &next.to_ne_bytes())
                .unwrap();
        }

        fs.lock().check().unwrap();
        assert_eq!(fs.lock().cross_chain_count(), 1);
        // Both files still read back; nothing was freed.
        assert_eq!(read_file(&fs, "a"), pattern(300));
    }

    #[test]
    fn garbage_sector_with_bad_key_is_erased() {
        let fs = mounted(8, SECTOR_SIZE);
        write_file(&fs, "keep", b"data");
        {
            // Scribble a header whose key is wrong and whose status
            // byte means nothing.
            let guard = fs.lock();
            let mut garbage = [0x5a_u8; 24];
            garbage[SectorHeader::STATUS_OFFSET] = 0x3c;
            guard.table.write_sector(5, 0, &garbage).unwrap();
        }

        assert_eq!(fs.lock().check(), Ok(1));
        let header = {
            let guard = fs.lock();
            SectorHeader::read_from(&guard.table, 5).unwrap()
        };
        // Erased back to pristine free.
        assert_eq!(header.status(), Some(SectorStatus::Free));
        assert_eq!(read_file(&fs, "keep"), b"data");
        assert_eq!(fs.lock().check(), Ok(0));
    }

    #[test]
    fn checker_leaves_open_but_unwritten_creates_alone() {
        let fs = mounted(8, SECTOR_SIZE);
        let mut guard = fs.lock();
        let fd = guard
            .open("pending", OpenFlags::CREATE | OpenFlags::WRONLY, 0)
            .unwrap();
        // No write yet: nothing on flash, nothing for check to see.
        assert_eq!(guard.check(), Ok(0));
        guard.close(fd).unwrap();
        assert_eq!(guard.erase("pending"), Err(FfsError::FileNotFound));
    }
}
