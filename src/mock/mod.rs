//! In-memory flash and devices for exercising the engine.
//!
//! [`MockFlash`] behaves like NOR flash: writes can only clear bits, and erasing resets whole sectors.
//! All areas of a [`MockDevice`] share one power supply, which can be set to fail after a number of
//! mutating operations. The operation hit by the cut is torn halfway, and every later operation fails
//! until power is restored. Writes tear at write unit boundaries, or optionally inside their first byte.

use std::{cell::Cell, collections::BTreeMap, rc::Rc, vec, vec::Vec};

use embedded_storage_async::nor_flash::{ErrorType, NorFlash, NorFlashErrorKind, ReadNorFlash};

use crate::{
    Device, Error, ImageSlots, Sector, Slot,
    header::{IMAGE_HEADER_SIZE, IMAGE_MAGIC, ImageHeader, ImageVersion},
    validate::ImageValidator,
};

pub const PRIMARY: Slot = Slot(0);
pub const SECONDARY: Slot = Slot(1);
pub const SCRATCH: Slot = Slot(2);

pub const PAIR: [ImageSlots; 1] = [ImageSlots {
    primary: PRIMARY,
    secondary: SECONDARY,
}];

#[derive(Debug, Default)]
pub struct WearTracker(BTreeMap<Sector, usize>);

impl WearTracker {
    pub fn increase(&mut self, sector: Sector) {
        *self.0.entry(sector).or_default() += 1;
    }

    /// Check wear on all sectors for worst wear.
    pub fn check(&self, wear_level: usize) -> bool {
        self.0.values().all(|v| *v <= wear_level)
    }
}

#[derive(Debug, Default)]
struct PowerSupply {
    /// Mutating operations still allowed to complete.
    budget: Cell<Option<usize>>,
    off: Cell<bool>,
    /// Torn writes leave their first byte half programmed, and nothing else.
    within_bytes: Cell<bool>,
}

enum Power {
    On,
    /// This operation is the one interrupted.
    Cut,
}

impl PowerSupply {
    fn check(&self) -> Result<(), NorFlashErrorKind> {
        if self.off.get() {
            Err(NorFlashErrorKind::Other)
        } else {
            Ok(())
        }
    }

    fn consume(&self) -> Result<Power, NorFlashErrorKind> {
        self.check()?;
        match self.budget.get() {
            Some(0) => {
                self.off.set(true);
                Ok(Power::Cut)
            }
            Some(n) => {
                self.budget.set(Some(n - 1));
                Ok(Power::On)
            }
            None => Ok(Power::On),
        }
    }
}

pub struct MockFlash<const SECTOR: usize> {
    data: Vec<u8>,
    power: Rc<PowerSupply>,
    pub wear: WearTracker,
    writes: usize,
    erases: usize,
}

impl<const SECTOR: usize> MockFlash<SECTOR> {
    fn new(sectors: usize, power: Rc<PowerSupply>) -> Self {
        Self {
            data: vec![0xff; sectors * SECTOR],
            power,
            wear: WearTracker::default(),
            writes: 0,
            erases: 0,
        }
    }

    fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, NorFlashErrorKind> {
        let start = offset as usize;
        let end = start.checked_add(len).ok_or(NorFlashErrorKind::OutOfBounds)?;
        if end > self.data.len() {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl<const SECTOR: usize> ErrorType for MockFlash<SECTOR> {
    type Error = NorFlashErrorKind;
}

impl<const SECTOR: usize> ReadNorFlash for MockFlash<SECTOR> {
    const READ_SIZE: usize = 1;

    async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.power.check()?;
        let range = self.range(offset, bytes.len())?;
        bytes.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl<const SECTOR: usize> NorFlash for MockFlash<SECTOR> {
    const WRITE_SIZE: usize = 4;
    const ERASE_SIZE: usize = SECTOR;

    async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        if from as usize % SECTOR != 0 || to as usize % SECTOR != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        if from > to {
            return Err(NorFlashErrorKind::OutOfBounds);
        }
        let range = self.range(from, (to - from) as usize)?;

        match self.power.consume()? {
            Power::On => {
                for sector in range.clone().step_by(SECTOR) {
                    self.wear.increase(Sector((sector / SECTOR) as u16));
                }
                self.data[range].fill(0xff);
                self.erases += 1;
                Ok(())
            }
            Power::Cut => {
                let half = range.start + range.len() / 2;
                self.data[range.start..half].fill(0xff);
                Err(NorFlashErrorKind::Other)
            }
        }
    }

    async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
            return Err(NorFlashErrorKind::NotAligned);
        }
        let range = self.range(offset, bytes.len())?;

        // Programming can only clear bits.
        if self.data[range.clone()]
            .iter()
            .zip(bytes)
            .any(|(old, new)| new & !old != 0)
        {
            return Err(NorFlashErrorKind::Other);
        }

        match self.power.consume()? {
            Power::On => {
                for (old, new) in self.data[range].iter_mut().zip(bytes) {
                    *old &= new;
                }
                self.writes += 1;
                Ok(())
            }
            Power::Cut if self.power.within_bytes.get() => {
                // Only the low nibble made it.
                self.data[range.start] &= bytes[0] | 0xf0;
                Err(NorFlashErrorKind::Other)
            }
            Power::Cut => {
                let torn = bytes.len() / 2 / Self::WRITE_SIZE * Self::WRITE_SIZE;
                for (old, new) in self.data[range.start..range.start + torn]
                    .iter_mut()
                    .zip(bytes)
                {
                    *old &= new;
                }
                Err(NorFlashErrorKind::Other)
            }
        }
    }
}

/// A device with one mock flash area per slot, slot numbers assigned in order.
pub struct MockDevice<const SECTOR: usize> {
    areas: Vec<MockFlash<SECTOR>>,
    power: Rc<PowerSupply>,
}

impl<const SECTOR: usize> MockDevice<SECTOR> {
    /// Device with areas of the given number of sectors, all erased.
    pub fn new(sectors: &[usize]) -> Self {
        let power = Rc::new(PowerSupply::default());
        Self {
            areas: sectors
                .iter()
                .map(|n| MockFlash::new(*n, power.clone()))
                .collect(),
            power,
        }
    }

    /// Raw contents of a slot, bypassing all flash semantics.
    pub fn flash(&mut self, slot: Slot) -> &mut [u8] {
        &mut self.areas[slot.0 as usize].data
    }

    pub fn writes(&self) -> usize {
        self.areas.iter().map(|a| a.writes).sum()
    }

    pub fn erases(&self) -> usize {
        self.areas.iter().map(|a| a.erases).sum()
    }

    pub fn check_wear(&self, slot: Slot, wear_level: usize) -> bool {
        self.areas[slot.0 as usize].wear.check(wear_level)
    }

    /// Let `ops` more writes or erases complete, then tear the next one and fail everything after it.
    pub fn cut_power_after(&mut self, ops: usize) {
        self.power.budget.set(Some(ops));
        self.power.off.set(false);
    }

    /// Choose whether a torn write leaves a half programmed byte instead of whole write units.
    pub fn tear_within_bytes(&mut self, within: bool) {
        self.power.within_bytes.set(within);
    }

    pub fn restore_power(&mut self) {
        self.power.budget.set(None);
        self.power.off.set(false);
    }

    pub fn power_was_cut(&self) -> bool {
        self.power.off.get()
    }

    /// Place an image with a recognizable body at `offset` into `slot`.
    pub fn program_image(&mut self, slot: Slot, offset: usize, header: &ImageHeader, fill: u8) {
        let flash = self.flash(slot);
        let body = offset + header.hdr_size as usize;
        flash[offset..body].fill(0);
        flash[offset..offset + IMAGE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        for (i, byte) in flash[body..body + header.img_size as usize]
            .iter_mut()
            .enumerate()
        {
            *byte = fill ^ (i % 251) as u8;
        }
    }
}

impl<const SECTOR: usize> Device for MockDevice<SECTOR> {
    type Flash = MockFlash<SECTOR>;

    fn area(&mut self, slot: Slot) -> Option<&mut Self::Flash> {
        self.areas.get_mut(slot.0 as usize)
    }
}

pub fn image_header(img_size: u32, major: u8) -> ImageHeader {
    ImageHeader {
        magic: IMAGE_MAGIC,
        load_addr: 0,
        hdr_size: IMAGE_HEADER_SIZE as u16,
        protect_tlv_size: 0,
        img_size,
        flags: 0,
        version: ImageVersion {
            major,
            minor: 0,
            revision: 0,
            build_num: 0,
        },
    }
}

/// Validator that refuses every image.
pub struct Rejecting;

impl ImageValidator for Rejecting {
    async fn validate<D: Device>(
        &mut self,
        _device: &mut D,
        _slot: Slot,
        _offset: u32,
        _header: &ImageHeader,
    ) -> Result<(), Error> {
        Err(Error::BadImage)
    }
}

/// Validator that refuses images below a major version.
pub struct MinimumVersion(pub u8);

impl ImageValidator for MinimumVersion {
    async fn validate<D: Device>(
        &mut self,
        _device: &mut D,
        _slot: Slot,
        _offset: u32,
        header: &ImageHeader,
    ) -> Result<(), Error> {
        if header.version.major >= self.0 {
            Ok(())
        } else {
            Err(Error::BadVersion)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_only_clear_bits() {
        let mut device: MockDevice<256> = MockDevice::new(&[2]);
        let flash = device.area(PRIMARY).unwrap();
        embassy_futures::block_on(async {
            flash.write(0, &[0x0f, 0xff, 0xff, 0xff]).await.unwrap();
            flash.write(0, &[0x07, 0xff, 0xff, 0xff]).await.unwrap();
            assert_eq!(
                flash.write(0, &[0x10, 0xff, 0xff, 0xff]).await,
                Err(NorFlashErrorKind::Other)
            );
            assert_eq!(flash.write(2, &[0; 4]).await, Err(NorFlashErrorKind::NotAligned));
            assert_eq!(flash.erase(0, 100).await, Err(NorFlashErrorKind::NotAligned));
        });
        assert_eq!(device.flash(PRIMARY)[0], 0x07);
        assert_eq!(device.writes(), 2);
    }

    #[test]
    fn torn_write_in_units() {
        let mut device: MockDevice<256> = MockDevice::new(&[2]);
        device.cut_power_after(0);
        let flash = device.area(PRIMARY).unwrap();
        embassy_futures::block_on(async {
            assert!(flash.write(0, &[0x01; 8]).await.is_err());
            // Everything fails until power returns.
            assert!(flash.read(0, &mut [0u8; 1]).await.is_err());
        });
        assert!(device.power_was_cut());
        assert_eq!(device.flash(PRIMARY)[..8], [0x01, 0x01, 0x01, 0x01, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn torn_write_within_byte() {
        let mut device: MockDevice<256> = MockDevice::new(&[2]);
        device.tear_within_bytes(true);
        device.cut_power_after(1);
        let flash = device.area(PRIMARY).unwrap();
        embassy_futures::block_on(async {
            flash.write(0, &[0x00; 4]).await.unwrap();
            assert!(flash.write(8, &[0x01, 0x01, 0x01, 0x01]).await.is_err());
        });
        device.restore_power();
        assert_eq!(device.flash(PRIMARY)[..4], [0x00; 4]);
        assert_eq!(device.flash(PRIMARY)[8..12], [0xf1, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn torn_erase_clears_first_half() {
        let mut device: MockDevice<256> = MockDevice::new(&[2]);
        device.flash(PRIMARY).fill(0);
        device.cut_power_after(0);
        let flash = device.area(PRIMARY).unwrap();
        assert!(embassy_futures::block_on(flash.erase(0, 512)).is_err());
        assert!(device.flash(PRIMARY)[..256].iter().all(|b| *b == 0xff));
        assert!(device.flash(PRIMARY)[256..].iter().all(|b| *b == 0x00));
    }
}
