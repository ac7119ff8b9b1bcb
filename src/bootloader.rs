//! Boot context: configuration of the image slots, queries on their state and the boot flow.

use defmt_or_log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    Device, Error, Slot,
    boot::Boot,
    decision,
    executor::{self, Executor},
    header::{self, ImageHeader},
    strategies::{Strategy, SwapStrategy},
    trailer::{self, Flag, SwapState, SwapType},
    validate::{self, ImageValidator},
};

/// Largest number of image pairs, bounded by the swap info nibble.
pub const MAX_IMAGES: usize = 15;

/// The slots of one image index.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageSlots {
    /// Slot the image is run from.
    pub primary: Slot,
    /// Slot updates are staged in.
    pub secondary: Slot,
}

/// How image pairs exchange their content.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapMode {
    /// Equal slots and a single scratch sector shared by all pairs.
    Scratch { scratch: Slot },
    /// Equal slots, the primary keeping one spare sector.
    Move,
    /// Secondary slots one sector larger than their primary.
    Offset,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Config<'a> {
    /// Slot pairs by image index.
    pub images: &'a [ImageSlots],
    pub mode: SwapMode,
}

impl Config<'_> {
    /// Check that every slot has a single role.
    pub fn check(&self) -> Result<(), Error> {
        if self.images.is_empty() || self.images.len() > MAX_IMAGES {
            return Err(Error::BadArgs);
        }

        let scratch = match self.mode {
            SwapMode::Scratch { scratch } => Some(scratch),
            SwapMode::Move | SwapMode::Offset => None,
        };

        let slots = || {
            self.images
                .iter()
                .flat_map(|pair| [pair.primary, pair.secondary])
                .chain(scratch)
        };
        let unique = slots()
            .enumerate()
            .all(|(i, slot)| slots().skip(i + 1).all(|other| other != slot));
        if !unique {
            return Err(Error::BadArgs);
        }
        Ok(())
    }
}

/// Outcome of [`Bootloader::boot_go`]: the image to run.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootResponse {
    pub slot: Slot,
    pub header: ImageHeader,
    /// Action taken for image 0 on this boot.
    pub swap_type: SwapType,
}

impl BootResponse {
    /// Jump into the image, given the address at which its slot is mapped.
    ///
    /// # Safety
    /// `slot_base` must be the memory mapped start of [`BootResponse::slot`], and the image must be
    /// linked to run from there.
    pub unsafe fn jump<B: Boot>(&self, slot_base: u32) -> ! {
        unsafe { B::boot_image(slot_base, &self.header) }
    }
}

/// Explicit bootloader context for a device and its configuration.
pub struct Bootloader<'a, D: Device> {
    pub(crate) device: &'a mut D,
    pub(crate) config: Config<'a>,
}

impl<'a, D: Device> Bootloader<'a, D> {
    /// Check the configuration against the device.
    pub fn new(device: &'a mut D, config: Config<'a>) -> Result<Self, Error> {
        config.check()?;
        for (image, slots) in config.images.iter().enumerate() {
            Executor::new(&mut *device, image as u8, *slots, config.mode).inspect_err(|_| {
                error!("Slots of image {} do not fit {:?}", image, config.mode);
            })?;
        }
        Ok(Self { device, config })
    }

    pub fn device(&mut self) -> &mut D {
        self.device
    }

    pub fn config(&self) -> Config<'a> {
        self.config
    }

    pub(crate) fn slots(&self, image: u8) -> Result<ImageSlots, Error> {
        self.config
            .images
            .get(usize::from(image))
            .copied()
            .ok_or(Error::BadArgs)
    }

    /// Image index a slot belongs to.
    pub(crate) fn image_of(&self, slot: Slot) -> Option<u8> {
        self.config
            .images
            .iter()
            .position(|pair| pair.primary == slot || pair.secondary == slot)
            .map(|image| image as u8)
    }

    pub(crate) fn executor(&mut self, image: u8) -> Result<Executor<'_, D>, Error> {
        let slots = self.slots(image)?;
        Executor::new(self.device, image, slots, self.config.mode)
    }

    /// Where the incoming image of `image` starts in its secondary slot.
    pub(crate) fn secondary_image_offset(&mut self, image: u8) -> Result<u32, Error> {
        let slots = self.slots(image)?;
        let geometry = executor::geometry(self.device, slots, self.config.mode)?;
        let strategy = SwapStrategy::new(
            self.config.mode,
            slots,
            geometry,
            SwapType::Test,
        )?;
        Ok(strategy.secondary_image_offset())
    }

    /// Decide from the trailers alone, ignoring swaps in progress.
    pub(crate) async fn decide(&mut self, image: u8) -> Result<SwapType, Error> {
        let slots = self.slots(image)?;
        let primary = trailer::read_trailer(self.device, slots.primary).await?;
        let secondary = trailer::read_trailer(self.device, slots.secondary).await?;
        Ok(decision::decide(image, primary.as_ref(), secondary.as_ref()))
    }

    /// Action the next boot takes for `image`. A swap in progress is reported first.
    pub async fn swap_type(&mut self, image: u8) -> Result<SwapType, Error> {
        if let Some(progress) = self.executor(image)?.progress().await? {
            return Ok(progress.swap_type);
        }
        self.decide(image).await
    }

    pub async fn read_swap_state(&mut self, slot: Slot) -> Result<SwapState, Error> {
        trailer::read_swap_state(self.device, slot).await
    }

    pub async fn read_image_ok(&mut self, slot: Slot) -> Result<Flag, Error> {
        Ok(self.read_swap_state(slot).await?.image_ok)
    }

    pub async fn load_header(&mut self, slot: Slot) -> Result<ImageHeader, Error> {
        header::load_header(self.device, slot).await
    }

    pub async fn load_header_at(&mut self, slot: Slot, offset: u32) -> Result<ImageHeader, Error> {
        header::load_header_at(self.device, slot, offset).await
    }

    /// Bring one image pair into a bootable state.
    async fn prepare<V: ImageValidator>(
        &mut self,
        image: u8,
        validator: &mut V,
    ) -> Result<SwapType, Error> {
        let swap_type = self.swap_type(image).await?;
        match swap_type {
            SwapType::None => Ok(SwapType::None),
            SwapType::Test | SwapType::Permanent | SwapType::Revert => {
                self.executor(image)?.run(validator, swap_type).await
            }
            SwapType::Fail | SwapType::Panic => {
                error!("Image {}: trailers are inconsistent", image);
                Err(Error::BadStatus)
            }
        }
    }

    /// Run the boot sequence: carry out pending swaps for every image pair, then validate the primary images.
    pub async fn boot_go<V: ImageValidator>(
        &mut self,
        validator: &mut V,
    ) -> Result<BootResponse, Error> {
        let mut response = None;

        for image in 0..self.config.images.len() as u8 {
            let swap_type = self.prepare(image, validator).await?;
            if swap_type == SwapType::Fail {
                warn!("Image {}: staged update rejected, keeping current image", image);
            }

            let slot = self.slots(image)?.primary;
            let header = header::load_header(self.device, slot).await?;
            if !validate::accepts(validator, self.device, slot, 0, &header).await? {
                error!("Image {}: primary image rejected", image);
                return Err(Error::BadImage);
            }

            if image == 0 {
                response = Some(BootResponse {
                    slot,
                    header,
                    swap_type,
                });
            }
        }

        let response = response.ok_or(Error::BadArgs)?;
        info!("Booting slot {} after {:?}", response.slot.0, response.swap_type);
        Ok(response)
    }
}
