use std::fmt;
use std::ops::RangeInclusive;

use pcx_x86::Width;
use rustc_hash::FxHashMap;

use crate::exception::Exception;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_SHIFT;

/// Physical memory and I/O as seen by the processor. Addresses are linear (paging is not
/// modelled).
///
/// Multi-byte accessors are little-endian. Implementations that can fault part-way through a
/// wide write should override the wide accessors to check the whole range first.
pub trait CpuBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Exception>;
    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), Exception>;

    fn read_u16(&mut self, addr: u32) -> Result<u16, Exception> {
        let lo = self.read_u8(addr)?;
        let hi = self.read_u8(addr.wrapping_add(1))?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, Exception> {
        let lo = self.read_u16(addr)?;
        let hi = self.read_u16(addr.wrapping_add(2))?;
        Ok(u32::from(lo) | (u32::from(hi) << 16))
    }

    fn read_u64(&mut self, addr: u32) -> Result<u64, Exception> {
        let lo = self.read_u32(addr)?;
        let hi = self.read_u32(addr.wrapping_add(4))?;
        Ok(u64::from(lo) | (u64::from(hi) << 32))
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), Exception> {
        let [lo, hi] = value.to_le_bytes();
        self.write_u8(addr, lo)?;
        self.write_u8(addr.wrapping_add(1), hi)
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), Exception> {
        self.write_u16(addr, value as u16)?;
        self.write_u16(addr.wrapping_add(2), (value >> 16) as u16)
    }

    fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), Exception> {
        self.write_u32(addr, value as u32)?;
        self.write_u32(addr.wrapping_add(4), (value >> 32) as u32)
    }

    fn io_read(&mut self, port: u16, width: Width) -> Result<u32, Exception>;
    fn io_write(&mut self, port: u16, width: Width, value: u32) -> Result<(), Exception>;

    /// Per-page write generations used to detect self-modifying code. Buses that return `None`
    /// never invalidate cached blocks on their own.
    fn code_versions(&self) -> Option<&PageVersionTracker> {
        None
    }
}

/// Read `width` bytes at a linear address.
pub fn read_sized(bus: &mut dyn CpuBus, addr: u32, width: Width) -> Result<u32, Exception> {
    match width {
        Width::W8 => bus.read_u8(addr).map(u32::from),
        Width::W16 => bus.read_u16(addr).map(u32::from),
        Width::W32 => bus.read_u32(addr),
    }
}

pub fn write_sized(
    bus: &mut dyn CpuBus,
    addr: u32,
    width: Width,
    value: u32,
) -> Result<(), Exception> {
    match width {
        Width::W8 => bus.write_u8(addr, value as u8),
        Width::W16 => bus.write_u16(addr, value as u16),
        Width::W32 => bus.write_u32(addr, value),
    }
}

/// Version stamp of one page at the time a block was decoded from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageStamp {
    pub page: u32,
    pub version: u32,
}

/// Monotonic per-page write counters.
///
/// Pages that were never written report version 0.
#[derive(Debug, Clone, Default)]
pub struct PageVersionTracker {
    versions: FxHashMap<u32, u32>,
}

impl PageVersionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn version(&self, page: u32) -> u32 {
        self.versions.get(&page).copied().unwrap_or(0)
    }

    /// Bump every page touched by a write of `len` bytes at `addr`.
    pub fn bump_write(&mut self, addr: u32, len: u32) {
        if len == 0 {
            return;
        }
        let first = addr >> PAGE_SHIFT;
        let last = addr.wrapping_add(len - 1) >> PAGE_SHIFT;
        let mut page = first;
        loop {
            let v = self.versions.entry(page).or_insert(0);
            *v = v.wrapping_add(1);
            if page == last {
                break;
            }
            page = page.wrapping_add(1);
        }
    }

    pub fn stamp(&self, page: u32) -> PageStamp {
        PageStamp {
            page,
            version: self.version(page),
        }
    }

    pub fn is_current(&self, stamp: &PageStamp) -> bool {
        self.version(stamp.page) == stamp.version
    }
}

/// A device answering `in`/`out` on a range of ports.
pub trait PortDevice {
    fn read(&mut self, port: u16, width: Width) -> u32;
    fn write(&mut self, port: u16, width: Width, value: u32);
}

/// Port space with range-registered devices. Unclaimed reads float high; unclaimed writes are
/// dropped.
#[derive(Default)]
pub struct IoPortMap {
    devices: Vec<(RangeInclusive<u16>, Box<dyn PortDevice>)>,
}

impl fmt::Debug for IoPortMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.devices.iter().map(|(range, _)| range))
            .finish()
    }
}

impl IoPortMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Later registrations shadow earlier ones on overlapping ports.
    pub fn register(&mut self, ports: RangeInclusive<u16>, device: Box<dyn PortDevice>) {
        self.devices.push((ports, device));
    }

    fn device(&mut self, port: u16) -> Option<&mut Box<dyn PortDevice>> {
        self.devices
            .iter_mut()
            .rev()
            .find(|(range, _)| range.contains(&port))
            .map(|(_, device)| device)
    }

    pub fn read(&mut self, port: u16, width: Width) -> u32 {
        match self.device(port) {
            Some(device) => device.read(port, width) & width.mask(),
            None => width.mask(),
        }
    }

    pub fn write(&mut self, port: u16, width: Width, value: u32) {
        if let Some(device) = self.device(port) {
            device.write(port, width, value & width.mask());
        }
    }
}

/// Flat RAM starting at linear address 0, used by tests and the command-line runner.
///
/// Every store bumps the page version tracker so cached blocks built from overwritten code are
/// noticed.
#[derive(Debug)]
pub struct FlatBus {
    mem: Vec<u8>,
    ports: IoPortMap,
    versions: PageVersionTracker,
}

impl FlatBus {
    pub fn new(size: usize) -> Self {
        Self {
            mem: vec![0; size],
            ports: IoPortMap::new(),
            versions: PageVersionTracker::new(),
        }
    }

    pub fn size(&self) -> usize {
        self.mem.len()
    }

    /// Copy `data` into memory, as a loader would. Counts as a write for code versioning.
    pub fn load(&mut self, addr: u32, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        self.mem[start..end].copy_from_slice(data);
        self.versions.bump_write(addr, data.len() as u32);
    }

    pub fn slice(&self, addr: u32, len: usize) -> &[u8] {
        let start = addr as usize;
        &self.mem[start..start + len]
    }

    pub fn ports_mut(&mut self) -> &mut IoPortMap {
        &mut self.ports
    }

    fn range(&self, addr: u32, len: u32, write: bool) -> Result<std::ops::Range<usize>, Exception> {
        let start = addr as usize;
        let end = start + len as usize;
        if end > self.mem.len() {
            return Err(Exception::PageFault {
                addr,
                code: if write { 2 } else { 0 },
            });
        }
        Ok(start..end)
    }

    fn read_bytes<const N: usize>(&self, addr: u32) -> Result<[u8; N], Exception> {
        let range = self.range(addr, N as u32, false)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.mem[range]);
        Ok(out)
    }

    fn write_bytes(&mut self, addr: u32, bytes: &[u8]) -> Result<(), Exception> {
        let range = self.range(addr, bytes.len() as u32, true)?;
        self.mem[range].copy_from_slice(bytes);
        self.versions.bump_write(addr, bytes.len() as u32);
        Ok(())
    }
}

impl CpuBus for FlatBus {
    fn read_u8(&mut self, addr: u32) -> Result<u8, Exception> {
        self.read_bytes::<1>(addr).map(|b| b[0])
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> Result<(), Exception> {
        self.write_bytes(addr, &[value])
    }

    fn read_u16(&mut self, addr: u32) -> Result<u16, Exception> {
        self.read_bytes(addr).map(u16::from_le_bytes)
    }

    fn read_u32(&mut self, addr: u32) -> Result<u32, Exception> {
        self.read_bytes(addr).map(u32::from_le_bytes)
    }

    fn read_u64(&mut self, addr: u32) -> Result<u64, Exception> {
        self.read_bytes(addr).map(u64::from_le_bytes)
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> Result<(), Exception> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> Result<(), Exception> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u64(&mut self, addr: u32, value: u64) -> Result<(), Exception> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn io_read(&mut self, port: u16, width: Width) -> Result<u32, Exception> {
        Ok(self.ports.read(port, width))
    }

    fn io_write(&mut self, port: u16, width: Width, value: u32) -> Result<(), Exception> {
        self.ports.write(port, width, value);
        Ok(())
    }

    fn code_versions(&self) -> Option<&PageVersionTracker> {
        Some(&self.versions)
    }
}
