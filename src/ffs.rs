use alloc::sync::Arc;
use bitflags::bitflags;
use log::{debug, info};
use spin::Mutex;

use crate::{
    allocator::SectorAllocator,
    error::{FfsError, FfsResult},
    flash_dev::Clock,
    layout::{FileNode, SectorHeader, SectorStatus},
    section::SectionTable,
    MAX_FILE_DESCRIPTORS, NEW_FILE_NAME, SECTOR_HEADER_SIZE, SECTOR_NONE,
};

bitflags! {
    /// Open flags, numerically compatible with the return-code
    /// protocol. Read-only is the empty set.
    pub struct OpenFlags: u32 {
        const RDONLY = 0;
        const WRONLY = 0x0001;
        const RDWR   = 0x0002;
        const CREATE = 0x0100;
    }
}

/// Space query selector.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SpaceOption {
    /// Sum of free payload bytes.
    FreeBytes,
    /// Count of free sectors.
    FreeSectors,
    /// Sum of payload bytes over every sector, free or used.
    TotalBytes,
    /// Total sector count.
    TotalSectors,
    /// Erase every managed sector, formatting the medium.
    FormatAll,
}

impl SpaceOption {
    /// Decode the numeric protocol; unknown codes have no meaning.
    pub const fn from_raw(code: u32) -> Option<SpaceOption> {
        match code {
            0 => Some(SpaceOption::FreeBytes),
            1 => Some(SpaceOption::FreeSectors),
            2 => Some(SpaceOption::TotalBytes),
            3 => Some(SpaceOption::TotalSectors),
            128 => Some(SpaceOption::FormatAll),
            _ => None,
        }
    }
}

/// Per-open state. Lives only in memory; the medium never sees it.
#[derive(Clone, Copy)]
pub(crate) struct FileDescriptor {
    pub(crate) in_use: bool,
    pub(crate) flags: OpenFlags,
    /// Free the superseded chain when this descriptor closes.
    pub(crate) delete_old_file: bool,
    /// Write the in-memory filenode out when this descriptor closes.
    pub(crate) write_fnode: bool,
    /// Head sector of the file, None until the first write allocates it.
    pub(crate) fnode_sector: Option<u32>,
    /// Head sector of the chain being replaced, if any.
    pub(crate) old_fnode_sector: Option<u32>,
    pub(crate) position: u32,
    pub(crate) fnode: FileNode,
}

impl FileDescriptor {
    pub(crate) const EMPTY: FileDescriptor = FileDescriptor {
        in_use: false,
        flags: OpenFlags::empty(),
        delete_old_file: false,
        write_fnode: false,
        fnode_sector: None,
        old_fnode_sector: None,
        position: 0,
        fnode: FileNode::empty(),
    };
}

/// The flat flash file system.
///
/// One instance manages the sections of its table. `mount` wraps the
/// instance in `Arc<Mutex<_>>`; the mutex is the serialization lock,
/// so every operation appears in a total order.
pub struct FlashFileSystem {
    pub(crate) table: SectionTable,
    pub(crate) clock: Option<Arc<dyn Clock>>,
    pub(crate) allocator: SectorAllocator,
    pub(crate) descriptors: [FileDescriptor; MAX_FILE_DESCRIPTORS],
    /// Sectors found claimed by more than one chain in the last check.
    pub(crate) total_cross_chain: u32,
}

impl FlashFileSystem {
    pub fn mount(table: SectionTable, clock: Option<Arc<dyn Clock>>) -> Arc<Mutex<Self>> {
        info!(
            "mounting flash file system: {} sections, {} sectors",
            table.sections().len(),
            table.total_sectors()
        );
        Arc::new(Mutex::new(Self {
            table,
            clock,
            allocator: SectorAllocator::new(),
            descriptors: [FileDescriptor::EMPTY; MAX_FILE_DESCRIPTORS],
            total_cross_chain: 0,
        }))
    }

    /// Open a file, optionally creating it.
    ///
    /// Creating a name that already exists starts a replacement: the
    /// new content goes to a fresh chain, and the old chain is freed
    /// only when the descriptor closes. A crash in between leaves both
    /// on the medium for the checker to arbitrate by creation count.
    /// # Return
    /// * A file descriptor number.
    pub fn open(&mut self, name: &str, flags: OpenFlags, permissions: u8) -> FfsResult<usize> {
        let fd = self.get_descriptor()?;
        let located = match Self::locate_filenode(&self.table, name) {
            Ok(located) => located,
            Err(e) => {
                self.free_descriptor(fd);
                return Err(e);
            }
        };
        if !flags.contains(OpenFlags::CREATE) && located.is_none() {
            self.free_descriptor(fd);
            return Err(FfsError::FileDoesNotExist);
        }

        let desc = &mut self.descriptors[fd];
        if let Some((fnode, sector)) = located {
            desc.fnode = fnode;
            desc.fnode_sector = Some(sector);
        }
        if flags.contains(OpenFlags::CREATE) {
            let mut create_count = 0;
            if let Some((_, sector)) = located {
                // Replace on close, not now.
                create_count = desc.fnode.count.wrapping_add(1);
                desc.delete_old_file = true;
                desc.old_fnode_sector = Some(sector);
            }
            desc.fnode.set_name(name);
            desc.fnode_sector = None;
            desc.fnode.file_size = 0;
            desc.fnode.permissions = permissions;
            desc.fnode.count = create_count;
            desc.fnode.data_time = match &self.clock {
                Some(clock) => clock.now(),
                None => 0,
            };
        }
        desc.flags = flags;
        Ok(fd)
    }

    /// Close a descriptor. For a new file this writes the filenode
    /// into the head sector; for a replacement it then frees the old
    /// chain. The descriptor is released on every path.
    pub fn close(&mut self, fd: usize) -> FfsResult<()> {
        self.check_fd(fd)?;
        let desc = &mut self.descriptors[fd];
        let mut result = Ok(());
        if desc.write_fnode {
            if let Some(sector) = desc.fnode_sector {
                result = desc.fnode.write_to(&self.table, sector);
            }
        }
        if result.is_ok() && desc.delete_old_file {
            if let Some(old) = desc.old_fnode_sector {
                result = self.allocator.free_chain(&self.table, old).map(|_| ());
            }
        }
        self.free_descriptor(fd);
        result
    }

    /// Read from the current position, clamped to what is left of the
    /// file.
    /// # Return
    /// * Bytes read, or `InvalidFilePosition` once the position has
    ///   reached the end.
    pub fn read(&mut self, fd: usize, buf: &mut [u8]) -> FfsResult<usize> {
        self.check_fd(fd)?;
        let desc = &mut self.descriptors[fd];
        if desc.position >= desc.fnode.file_size {
            return Err(FfsError::InvalidFilePosition);
        }
        let head = match desc.fnode_sector {
            Some(sector) => sector,
            None => return Err(FfsError::InvalidFilePosition),
        };
        let (mut sector, mut header, mut offset) =
            Self::locate_position(&self.table, head, desc.position)?;

        let mut remaining = buf.len().min((desc.fnode.file_size - desc.position) as usize);
        let mut total = 0;
        while remaining > 0 {
            let span = ((header.sector_length - offset) as usize).min(remaining);
            self.table
                .read_sector(sector, offset as usize, &mut buf[total..total + span])?;
            remaining -= span;
            total += span;
            desc.position += span as u32;
            if remaining == 0 {
                break;
            }
            sector = match header.next() {
                Some(next) => next,
                None => return Err(FfsError::InvalidSectorNumber),
            };
            header = SectorHeader::read_from(&self.table, sector)?;
            offset = header.data_offset;
        }
        Ok(total)
    }

    /// Write at the current position, extending the chain with fresh
    /// sectors as needed. The first write of a new file allocates the
    /// head sector with room for the filenode (written at close).
    /// # Return
    /// * Bytes written, or `OutOfSpace`.
    pub fn write(&mut self, fd: usize, buf: &[u8]) -> FfsResult<usize> {
        self.check_fd(fd)?;
        let desc = &mut self.descriptors[fd];
        let (mut sector, mut header, mut offset) = match desc.fnode_sector {
            None => {
                let (sector, header) = self.allocator.allocate(&self.table, true)?;
                desc.write_fnode = true;
                desc.fnode_sector = Some(sector);
                (sector, header, header.data_offset)
            }
            Some(head) => Self::locate_position(&self.table, head, desc.position)?,
        };

        let mut remaining = buf.len();
        let mut total = 0;
        while remaining > 0 {
            let span = ((header.sector_length - offset) as usize).min(remaining);
            self.table
                .write_sector(sector, offset as usize, &buf[total..total + span])?;
            remaining -= span;
            total += span;
            desc.position += span as u32;
            if desc.position > desc.fnode.file_size {
                desc.fnode.file_size = desc.position;
            }
            if remaining == 0 {
                break;
            }
            // Chain on a new tail. The freshly formatted header left
            // Next at the all-ones sentinel, so patching it in place
            // only clears bits.
            let (new_sector, new_header) = self.allocator.allocate(&self.table, false)?;
            self.table.write_sector(
                sector,
                SectorHeader::NEXT_OFFSET,
                &new_sector.to_ne_bytes(),
            )?;
            sector = new_sector;
            header = new_header;
            offset = new_header.data_offset;
        }
        Ok(total)
    }

    /// Resume a directory scan from `handle` and return the next
    /// file's node, advancing the handle past it.
    /// # Return
    /// * None when there are no more files.
    pub fn next_directory(&mut self, handle: &mut u32) -> FfsResult<Option<FileNode>> {
        let mut sector = *handle;
        while self.table.is_valid(sector) {
            let header = SectorHeader::read_from(&self.table, sector)?;
            if header.status() == Some(SectorStatus::InUseFilenode) {
                let mut fnode = FileNode::read_from(&self.table, sector)?;
                *handle = sector + 1;
                if fnode.is_pending_create() {
                    fnode.set_name(NEW_FILE_NAME);
                }
                return Ok(Some(fnode));
            }
            sector += 1;
        }
        Ok(None)
    }

    /// Erase a file by name, marking its whole chain FREE_DIRTY.
    pub fn erase(&mut self, name: &str) -> FfsResult<()> {
        let (_, sector) = match Self::locate_filenode(&self.table, name)? {
            Some(found) => found,
            None => return Err(FfsError::FileNotFound),
        };
        debug!("erasing file chain at sector {}", sector);
        self.allocator.free_chain(&self.table, sector)?;
        Ok(())
    }

    /// Rename a file by rebuilding its head sector: allocate a new
    /// head with filenode space, stream the old head's payload across,
    /// write the filenode under the new name, splice the old tail back
    /// in, and free only the old head. Assumes both heads have the
    /// same payload capacity; a mismatch aborts with `OutOfSpace`.
    pub fn rename(&mut self, old_name: &str, new_name: &str) -> FfsResult<()> {
        let (fnode, old_sector) = match Self::locate_filenode(&self.table, old_name)? {
            Some(found) => found,
            None => return Err(FfsError::FileNotFound),
        };
        if Self::locate_filenode(&self.table, new_name)?.is_some() {
            return Err(FfsError::NewNameExists);
        }

        let old_header = SectorHeader::read_from(&self.table, old_sector)?;
        let old_capacity = old_header.payload_capacity();
        let old_next = old_header.next;

        let (new_sector, new_header) = self.allocator.allocate(&self.table, true)?;
        if new_header.payload_capacity() != old_capacity {
            self.allocator.free_chain(&self.table, new_sector)?;
            return Err(FfsError::OutOfSpace);
        }

        // Stream the head payload across in fixed-size chunks.
        let mut buf = [0u8; RENAME_CHUNK];
        let mut offset = new_header.data_offset;
        let mut remaining = old_capacity;
        while remaining > 0 {
            let span = (remaining as usize).min(RENAME_CHUNK);
            self.table
                .read_sector(old_sector, offset as usize, &mut buf[..span])?;
            self.table
                .write_sector(new_sector, offset as usize, &buf[..span])?;
            remaining -= span as u32;
            offset += span as u32;
        }

        let mut fnode = fnode;
        fnode.set_name(new_name);
        fnode.write_to(&self.table, new_sector)?;

        // Splice the old tail onto the new head. A single-sector file
        // keeps the sentinel the fresh header already carries.
        if old_next != SECTOR_NONE {
            self.table.write_sector(
                new_sector,
                SectorHeader::NEXT_OFFSET,
                &old_next.to_ne_bytes(),
            )?;
        }

        self.allocator.mark_free_dirty(&self.table, old_sector)?;
        debug!(
            "renamed head sector {} to {} ({:?} -> {:?})",
            old_sector, new_sector, old_name, new_name
        );
        Ok(())
    }

    /// Query or reclaim space.
    /// # Return
    /// * The tally the option asks for; for `FormatAll`, the payload
    ///   bytes made free by erasing everything.
    pub fn space(&mut self, option: SpaceOption) -> FfsResult<u64> {
        let total = self.table.total_sectors();
        let mut tally = 0u64;
        match option {
            SpaceOption::FormatAll => {
                for sector in 0..total {
                    self.table.erase_sector(sector)?;
                    tally += (self.table.sector_size(sector)? as usize - SECTOR_HEADER_SIZE) as u64;
                }
                info!("formatted {} sectors", total);
            }
            SpaceOption::TotalSectors => tally = total as u64,
            SpaceOption::TotalBytes => {
                for section in self.table.sections() {
                    tally += section.count as u64
                        * (section.sector_size as usize - SECTOR_HEADER_SIZE) as u64;
                }
            }
            SpaceOption::FreeBytes | SpaceOption::FreeSectors => {
                for sector in 0..total {
                    let header = SectorHeader::read_from(&self.table, sector)?;
                    match header.status() {
                        Some(SectorStatus::Free) | Some(SectorStatus::FreeDirty) => {
                            if option == SpaceOption::FreeBytes {
                                tally += (self.table.sector_size(sector)? as usize
                                    - SECTOR_HEADER_SIZE)
                                    as u64;
                            } else {
                                tally += 1;
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(tally)
    }

    /// High-water mark of headerless sectors met while allocating.
    pub fn error_sector_count(&self) -> u32 {
        self.allocator.error_sectors()
    }

    /// Sectors the last check found claimed by more than one chain.
    pub fn cross_chain_count(&self) -> u32 {
        self.total_cross_chain
    }

    /// Walk a file's chain to the sector holding `position`.
    /// # Return
    /// * (sector, its header, byte offset of the position within it).
    pub(crate) fn locate_position(
        table: &SectionTable,
        head: u32,
        position: u32,
    ) -> FfsResult<(u32, SectorHeader, u32)> {
        let mut sector = head;
        let mut walked = 0u32;
        loop {
            let header = SectorHeader::read_from(table, sector)?;
            let capacity = header.payload_capacity();
            if position < walked + capacity {
                let offset = header.data_offset + (position - walked);
                return Ok((sector, header, offset));
            }
            walked += capacity;
            sector = match header.next() {
                Some(next) => next,
                None => return Err(FfsError::InvalidFilePosition),
            };
        }
    }

    /// Scan every sector for a filenode carrying `name` (ASCII
    /// case-insensitive). First match wins.
    pub(crate) fn locate_filenode(
        table: &SectionTable,
        name: &str,
    ) -> FfsResult<Option<(FileNode, u32)>> {
        for sector in 0..table.total_sectors() {
            let header = SectorHeader::read_from(table, sector)?;
            if header.status() != Some(SectorStatus::InUseFilenode) {
                continue;
            }
            let fnode = FileNode::read_from(table, sector)?;
            if fnode.name_matches(name) {
                return Ok(Some((fnode, sector)));
            }
        }
        Ok(None)
    }

    fn check_fd(&self, fd: usize) -> FfsResult<()> {
        if fd >= MAX_FILE_DESCRIPTORS || !self.descriptors[fd].in_use {
            return Err(FfsError::InvalidFileDescriptor);
        }
        Ok(())
    }

    fn get_descriptor(&mut self) -> FfsResult<usize> {
        for (fd, desc) in self.descriptors.iter_mut().enumerate() {
            if !desc.in_use {
                *desc = FileDescriptor::EMPTY;
                desc.in_use = true;
                return Ok(fd);
            }
        }
        Err(FfsError::TooManyOpenFiles)
    }

    fn free_descriptor(&mut self, fd: usize) {
        self.descriptors[fd].in_use = false;
    }
}

const RENAME_CHUNK: usize = 128;
