//! RAM loading: run an image from RAM instead of swapping it into the primary slot.
//!
//! Both slots stay where they are. A test request is consumed by setting `copy_done` in the secondary
//! trailer when the image is first loaded; if the image has not confirmed itself by the next boot, the
//! primary image is loaded instead.

use core::ops::Range;

use defmt_or_log::{debug, error, info, warn};

use crate::{
    Bootloader, Device, Error, Slot, area,
    boot::Boot,
    header::{self, ImageHeader},
    trailer::{self, Flag, FlagField, SwapState, SwapType, TrailerLayout},
    validate::{self, ImageValidator},
};

/// Executable RAM the image is loaded into.
pub struct RamRegion<'m> {
    /// Address of the first byte of `memory`.
    pub base: u32,
    pub memory: &'m mut [u8],
}

impl RamRegion<'_> {
    /// Part of `memory` the image occupies.
    fn range(&self, header: &ImageHeader) -> Result<Range<usize>, Error> {
        let size = header.total_size().ok_or(Error::BadImage)?;
        let start = header
            .load_addr
            .checked_sub(self.base)
            .ok_or(Error::BadImage)? as usize;
        let end = start.checked_add(size as usize).ok_or(Error::BadImage)?;
        if end > self.memory.len() {
            return Err(Error::BadImage);
        }
        Ok(start..end)
    }
}

/// Copy the image in `slot` to its load address.
pub async fn load_image_to_ram<D: Device>(
    device: &mut D,
    slot: Slot,
    header: &ImageHeader,
    ram: &mut RamRegion<'_>,
) -> Result<(), Error> {
    let range = ram.range(header).inspect_err(|_| {
        warn!("Image load address {} outside of RAM", header.load_addr);
    })?;
    debug!("Loading slot {} to {}", slot.0, header.load_addr);
    area::read(device, slot, 0, &mut ram.memory[range]).await
}

/// Wipe a loaded image from RAM.
pub fn remove_image_from_ram(header: &ImageHeader, ram: &mut RamRegion<'_>) -> Result<(), Error> {
    let range = ram.range(header)?;
    ram.memory[range].fill(0);
    Ok(())
}

/// Erase a slot holding an image that is no longer wanted.
pub async fn remove_image_from_flash<D: Device>(device: &mut D, slot: Slot) -> Result<(), Error> {
    let size = area::size(device, slot)?;
    info!("Erasing slot {}", slot.0);
    area::erase(device, slot, 0, size).await
}

/// Outcome of [`Bootloader::boot_ram`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RamBoot {
    /// Slot the image was loaded from.
    pub slot: Slot,
    pub header: ImageHeader,
    /// [`SwapType::Fail`] if the requested image was rejected.
    pub swap_type: SwapType,
}

impl RamBoot {
    /// Jump into the loaded image.
    ///
    /// # Safety
    /// The image must have been loaded by [`Bootloader::boot_ram`] and the RAM left untouched since.
    pub unsafe fn jump<B: Boot>(&self) -> ! {
        unsafe { B::boot_image(self.header.load_addr, &self.header) }
    }
}

impl<D: Device> Bootloader<'_, D> {
    /// Slot to load, consuming a pending test request.
    async fn select_ram_slot(&mut self, image: u8) -> Result<(Slot, SwapType), Error> {
        let slots = self.slots(image)?;
        let secondary = trailer::read_trailer(self.device, slots.secondary).await?;

        match self.decide(image).await? {
            SwapType::Panic => {
                error!("Image {}: trailers are inconsistent", image);
                Err(Error::BadStatus)
            }
            SwapType::Permanent => Ok((slots.secondary, SwapType::Permanent)),
            SwapType::Test => {
                let state = secondary.unwrap_or(SwapState::UNSET);
                match (state.copy_done, state.image_ok) {
                    (Flag::Unset, _) => {
                        let layout = TrailerLayout::fields(self.device, slots.secondary)?;
                        trailer::write_flag(
                            self.device,
                            slots.secondary,
                            &layout,
                            FlagField::CopyDone,
                        )
                        .await?;
                        Ok((slots.secondary, SwapType::Test))
                    }
                    (_, Flag::Set) => Ok((slots.secondary, SwapType::None)),
                    _ => {
                        warn!("Image {}: test not confirmed, falling back", image);
                        Ok((slots.primary, SwapType::Revert))
                    }
                }
            }
            _ => Ok((slots.primary, SwapType::None)),
        }
    }

    /// Decide on an image and load it into `ram` instead of swapping.
    ///
    /// A requested image that is rejected by `validator` yields [`SwapType::Fail`] and the primary image
    /// is loaded in its place.
    pub async fn boot_ram<V: ImageValidator>(
        &mut self,
        image: u8,
        validator: &mut V,
        ram: &mut RamRegion<'_>,
    ) -> Result<RamBoot, Error> {
        let slots = self.slots(image)?;
        let (mut slot, mut swap_type) = self.select_ram_slot(image).await?;

        let header = loop {
            let candidate = match header::load_header(self.device, slot).await {
                Ok(header) if ram.range(&header).is_ok() => Some(header),
                Ok(_) | Err(Error::BadImage) => None,
                Err(e) => return Err(e),
            };
            let accepted = match &candidate {
                Some(header) => validate::accepts(validator, self.device, slot, 0, header).await?,
                None => false,
            };

            match candidate {
                Some(header) if accepted => break header,
                _ if slot != slots.primary => {
                    warn!("Image in slot {} rejected", slot.0);
                    slot = slots.primary;
                    swap_type = SwapType::Fail;
                }
                _ => {
                    error!("No bootable image for image {}", image);
                    return Err(Error::BadImage);
                }
            }
        };

        load_image_to_ram(self.device, slot, &header, ram).await?;
        info!("Loaded slot {} into RAM", slot.0);
        Ok(RamBoot {
            slot,
            header,
            swap_type,
        })
    }
}
