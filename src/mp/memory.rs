//! Physical memory descriptors and reservations.
//!
//! The bring-up code only reads the descriptor list; `MemoryMap` and
//! `MapServices` exist for kernels that arrive here via a multiboot2 loader
//! instead of firmware that already provides page allocation.

use bitflags::bitflags;
use multiboot2::{BootInformation, MemoryAreaType};

use super::platform::BootServices;
use super::types::{BASE_1MB, SIZE_4KB};

bitflags! {
    /// Resource attributes attached to a memory descriptor.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ResourceAttributes: u32 {
        const PRESENT = 1 << 0;
        const INITIALIZED = 1 << 1;
        const TESTED = 1 << 2;
        const READ_PROTECTED = 1 << 7;
        const WRITE_PROTECTED = 1 << 8;
        const EXECUTION_PROTECTED = 1 << 9;
        const UNCACHEABLE = 1 << 10;
        const WRITE_BACK_CACHEABLE = 1 << 12;

        const PROTECTED = Self::READ_PROTECTED.bits()
            | Self::WRITE_PROTECTED.bits()
            | Self::EXECUTION_PROTECTED.bits();
    }
}

/// What a physical range is backed by.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceType {
    SystemMemory = 0,
    MemoryMappedIo = 1,
    Io = 2,
    FirmwareDevice = 3,
    Reserved = 5,
}

/// Purpose recorded with an allocation so later stages keep away from it.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryType {
    BootServicesCode = 3,
    BootServicesData = 4,
    ReservedMemory = 0,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryDescriptor {
    pub start: u64,
    pub length: u64,
    pub resource_type: ResourceType,
    pub attributes: ResourceAttributes,
}

impl MemoryDescriptor {
    pub const fn new(
        start: u64,
        length: u64,
        resource_type: ResourceType,
        attributes: ResourceAttributes,
    ) -> Self {
        Self {
            start,
            length,
            resource_type,
            attributes,
        }
    }

    /// Present, tested system memory with no protection bits.
    pub const fn conventional(start: u64, length: u64) -> Self {
        Self::new(
            start,
            length,
            ResourceType::SystemMemory,
            ResourceAttributes::PRESENT
                .union(ResourceAttributes::INITIALIZED)
                .union(ResourceAttributes::TESTED),
        )
    }

    pub const fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    /// Free system memory the AP trampoline may be copied into.
    pub fn is_usable_low_memory(&self) -> bool {
        self.start < BASE_1MB
            && self.resource_type == ResourceType::SystemMemory
            && !self.attributes.intersects(ResourceAttributes::PROTECTED)
    }
}

/// A range handed out to a boot component.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Reservation {
    pub base: u64,
    pub length: u64,
    pub memory_type: MemoryType,
}

impl Reservation {
    pub const fn end(&self) -> u64 {
        self.base.saturating_add(self.length)
    }

    pub const fn overlaps(&self, base: u64, length: u64) -> bool {
        base < self.end() && self.base < base.saturating_add(length)
    }
}

/// Fixed-capacity descriptor list; no heap exists this early.
pub struct MemoryMap<const N: usize> {
    entries: [MemoryDescriptor; N],
    len: usize,
}

impl<const N: usize> MemoryMap<N> {
    pub const fn new() -> Self {
        Self {
            entries: [MemoryDescriptor::new(0, 0, ResourceType::Reserved, ResourceAttributes::empty()); N],
            len: 0,
        }
    }

    /// Append a descriptor; returns `false` when the map is full.
    pub fn push(&mut self, descriptor: MemoryDescriptor) -> bool {
        if self.len == N {
            return false;
        }
        self.entries[self.len] = descriptor;
        self.len += 1;
        true
    }

    pub fn as_slice(&self) -> &[MemoryDescriptor] {
        &self.entries[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Import the loader's memory map. Areas past capacity are dropped with a
    /// warning.
    pub fn from_multiboot2(boot_info: &BootInformation<'_>) -> Self {
        let mut map = Self::new();
        let Some(memmap) = boot_info.memory_map_tag() else {
            crate::kwarn!("MP: No memory map provided by bootloader");
            return map;
        };

        for area in memmap.memory_areas().iter() {
            let descriptor = match MemoryAreaType::from(area.typ()) {
                MemoryAreaType::Available => {
                    MemoryDescriptor::conventional(area.start_address(), area.size())
                }
                _ => MemoryDescriptor::new(
                    area.start_address(),
                    area.size(),
                    ResourceType::Reserved,
                    ResourceAttributes::PRESENT,
                ),
            };
            if !map.push(descriptor) {
                crate::kwarn!(
                    "MP: Memory map truncated to {} entries (loader reports {})",
                    N,
                    memmap.memory_areas().len()
                );
                break;
            }
        }
        map
    }
}

impl<const N: usize> Default for MemoryMap<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Page allocation over a `MemoryMap`, for loaders without boot services.
///
/// Pages are carved from system memory at or above 1 MiB, lowest first, and
/// never overlap an earlier reservation.
pub struct MapServices<'m, const N: usize, const R: usize> {
    map: &'m MemoryMap<N>,
    reservations: [Reservation; R],
    reserved: usize,
}

impl<'m, const N: usize, const R: usize> MapServices<'m, N, R> {
    pub fn new(map: &'m MemoryMap<N>) -> Self {
        Self {
            map,
            reservations: [Reservation {
                base: 0,
                length: 0,
                memory_type: MemoryType::ReservedMemory,
            }; R],
            reserved: 0,
        }
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations[..self.reserved]
    }

    fn overlapping(&self, base: u64, length: u64) -> Option<&Reservation> {
        self.reservations()
            .iter()
            .find(|r| r.overlaps(base, length))
    }

    fn push_reservation(&mut self, reservation: Reservation) -> bool {
        if self.reserved == R {
            crate::kwarn!(
                "MP: Reservation table full, {:#x}+{:#x} not recorded",
                reservation.base,
                reservation.length
            );
            return false;
        }
        self.reservations[self.reserved] = reservation;
        self.reserved += 1;
        true
    }
}

impl<'m, const N: usize, const R: usize> BootServices for MapServices<'m, N, R> {
    fn memory_descriptors(&self) -> &[MemoryDescriptor] {
        self.map.as_slice()
    }

    fn allocate_pages(&mut self, memory_type: MemoryType, pages: usize) -> Option<u64> {
        let length = (pages as u64).checked_mul(SIZE_4KB)?;
        if length == 0 {
            return None;
        }

        let map = self.map;
        for descriptor in map.as_slice() {
            if descriptor.resource_type != ResourceType::SystemMemory
                || descriptor.attributes.intersects(ResourceAttributes::PROTECTED)
            {
                continue;
            }

            let mut base = align_up(descriptor.start.max(BASE_1MB), SIZE_4KB);
            while base.saturating_add(length) <= descriptor.end() {
                match self.overlapping(base, length).map(Reservation::end) {
                    Some(blocked_until) => base = align_up(blocked_until, SIZE_4KB),
                    None => {
                        if !self.push_reservation(Reservation {
                            base,
                            length,
                            memory_type,
                        }) {
                            return None;
                        }
                        return Some(base);
                    }
                }
            }
        }
        None
    }

    fn record_allocation(&mut self, base: u64, length: u64, memory_type: MemoryType) -> bool {
        self.push_reservation(Reservation {
            base,
            length,
            memory_type,
        })
    }
}

pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}
