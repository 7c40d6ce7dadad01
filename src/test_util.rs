use alloc::string::{String, ToString};
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::error::FfsResult;
use crate::ffs::{FlashFileSystem, OpenFlags, SpaceOption};
use crate::flash_dev::{Clock, FlashDevice};
use crate::section::{FlashSection, SectionTable};

/// In-memory NOR flash. Programming ANDs bytes into place, the way
/// real NOR cells behave, so a write that tries to set a bit without
/// an erase corrupts data instead of silently passing.
pub struct RamFlash {
    sectors: Mutex<Vec<Vec<u8>>>,
}

impl RamFlash {
    pub fn new(count: usize, sector_size: usize) -> Arc<Self> {
        Arc::new(Self {
            sectors: Mutex::new(vec![vec![0xff; sector_size]; count]),
        })
    }
}

impl FlashDevice for RamFlash {
    fn read(&self, sector: u32, offset: usize, buf: &mut [u8]) -> FfsResult<()> {
        let sectors = self.sectors.lock();
        let data = &sectors[sector as usize];
        buf.copy_from_slice(&data[offset..offset + buf.len()]);
        Ok(())
    }

    fn write(&self, sector: u32, offset: usize, buf: &[u8]) -> FfsResult<()> {
        let mut sectors = self.sectors.lock();
        let data = &mut sectors[sector as usize];
        for (cell, byte) in data[offset..offset + buf.len()].iter_mut().zip(buf) {
            *cell &= *byte;
        }
        Ok(())
    }

    fn erase(&self, sector: u32) -> FfsResult<()> {
        let mut sectors = self.sectors.lock();
        sectors[sector as usize].fill(0xff);
        Ok(())
    }
}

pub fn single_section(count: u32, sector_size: u32) -> SectionTable {
    SectionTable::new(vec![FlashSection {
        device: 0,
        start: 0,
        count,
        sector_size,
        flash: RamFlash::new(count as usize, sector_size as usize),
    }])
}

/// A mounted, freshly formatted file system over one RAM section.
pub fn mounted(count: u32, sector_size: u32) -> Arc<Mutex<FlashFileSystem>> {
    let fs = FlashFileSystem::mount(single_section(count, sector_size), None);
    fs.lock().space(SpaceOption::FormatAll).unwrap();
    fs
}

pub fn mounted_with_clock(
    count: u32,
    sector_size: u32,
    clock: Arc<dyn Clock>,
) -> Arc<Mutex<FlashFileSystem>> {
    let fs = FlashFileSystem::mount(single_section(count, sector_size), Some(clock));
    fs.lock().space(SpaceOption::FormatAll).unwrap();
    fs
}

pub fn write_file(fs: &Mutex<FlashFileSystem>, name: &str, data: &[u8]) {
    let mut guard = fs.lock();
    let fd = guard
        .open(name, OpenFlags::CREATE | OpenFlags::WRONLY, 0)
        .unwrap();
    assert_eq!(guard.write(fd, data), Ok(data.len()));
    guard.close(fd).unwrap();
}

pub fn read_file(fs: &Mutex<FlashFileSystem>, name: &str) -> Vec<u8> {
    let mut guard = fs.lock();
    let fd = guard.open(name, OpenFlags::RDONLY, 0).unwrap();
    let size = guard.descriptors[fd].fnode.file_size as usize;
    let mut data = vec![0u8; size];
    assert_eq!(guard.read(fd, &mut data), Ok(size));
    guard.close(fd).unwrap();
    data
}

/// Collect (name, size, count) for every directory entry.
pub fn list(fs: &Mutex<FlashFileSystem>) -> Vec<(String, u32, u32)> {
    let mut guard = fs.lock();
    let mut handle = 0;
    let mut entries = Vec::new();
    while let Some(fnode) = guard.next_directory(&mut handle).unwrap() {
        entries.push((fnode.name().to_string(), fnode.file_size, fnode.count));
    }
    entries
}

pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}
