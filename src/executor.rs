//! Swap executor: moves sectors between an image pair and records progress after every step.
//!
//! Progress markers live in the primary trailer, except where the strategy says otherwise. A trailer that
//! does not exist yet when the first marker is due is created on the spot: swap size, swap info, the
//! markers of all steps done so far and the magic last, such that a torn header never reads as valid.
//!
//! On the next boot, an interrupted swap is found from those markers and resumed from the first step
//! without one. Every step erases its destination before copying, so repeating a step is harmless.

use defmt_or_log::{debug, info, warn};

use crate::{
    Device, Error, ImageSlots, Slot, Step, SwapMode, area,
    header,
    strategies::{Geometry, Strategy, SwapStrategy},
    trailer::{self, FlagField, Magic, SwapInfo, SwapType, TrailerLayout},
    validate::{self, ImageValidator},
};

/// An interrupted swap, as found in the trailers.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Progress {
    pub swap_type: SwapType,
    /// First step that has not been recorded.
    pub next: Step,
}

/// Sizes of an image pair as seen through `device`.
pub(crate) fn geometry<D: Device>(
    device: &mut D,
    slots: ImageSlots,
    mode: SwapMode,
) -> Result<Geometry, Error> {
    let sector_size = area::sector_size::<D>();
    let mut sectors = |slot: Slot| -> Result<u16, Error> {
        if area::size(device, slot)? % sector_size != 0 {
            return Err(Error::BadArgs);
        }
        area::sector_count(device, slot)
    };

    let primary_sectors = sectors(slots.primary)?;
    let secondary_sectors = sectors(slots.secondary)?;
    let scratch_sectors = match mode {
        SwapMode::Scratch { scratch } => sectors(scratch)?,
        SwapMode::Move | SwapMode::Offset => 0,
    };

    let layout = TrailerLayout::new(
        u32::from(primary_sectors) * sector_size,
        area::write_size::<D>(),
        u16::max(primary_sectors, secondary_sectors),
    )?;

    Ok(Geometry {
        sector_size,
        primary_sectors,
        secondary_sectors,
        scratch_sectors,
        trailer_size: layout.size(),
    })
}

/// Executes swaps for a single image pair.
pub struct Executor<'a, D: Device> {
    device: &'a mut D,
    image: u8,
    slots: ImageSlots,
    mode: SwapMode,
    geometry: Geometry,
}

impl<'a, D: Device> Executor<'a, D> {
    /// Check the geometry of the image pair against the strategy of `mode`.
    pub fn new(
        device: &'a mut D,
        image: u8,
        slots: ImageSlots,
        mode: SwapMode,
    ) -> Result<Self, Error> {
        let geometry = geometry(device, slots, mode)?;

        // Both directions need to be feasible before any swap is started.
        SwapStrategy::new(mode, slots, geometry, SwapType::Permanent)?;
        SwapStrategy::new(mode, slots, geometry, SwapType::Revert)?;

        Ok(Self {
            device,
            image,
            slots,
            mode,
            geometry,
        })
    }

    pub const fn geometry(&self) -> Geometry {
        self.geometry
    }

    /// Strategy carrying out `swap_type`.
    pub fn strategy(&self, swap_type: SwapType) -> Result<SwapStrategy, Error> {
        SwapStrategy::new(self.mode, self.slots, self.geometry, swap_type)
    }

    /// Trailer layout of `slot`, with room for the progress of the largest slot of the pair.
    fn layout(&mut self, slot: Slot) -> Result<TrailerLayout, Error> {
        TrailerLayout::new(
            area::size(self.device, slot)?,
            area::write_size::<D>(),
            u16::max(self.geometry.primary_sectors, self.geometry.secondary_sectors),
        )
    }

    /// Bytes in front of the trailer in the last sector of a slot.
    fn body(&self) -> u32 {
        let sector = self.geometry.sector_size;
        (sector - self.geometry.trailer_size % sector) % sector
    }

    /// Progress recorded in the trailer of `slot`, if it belongs to a started swap of this pair.
    async fn progress_in(&mut self, slot: Slot) -> Result<Option<Progress>, Error> {
        let layout = self.layout(slot)?;
        let state = trailer::read_with(self.device, slot, &layout).await?;

        let Some(swap_type) = state.request() else {
            return Ok(None);
        };
        if state.image_num() != Some(self.image) || state.copy_done == trailer::Flag::Set {
            return Ok(None);
        }

        let next = trailer::read_status(self.device, slot, &layout).await?;
        let progress = Progress { swap_type, next };
        match state.copy_done {
            trailer::Flag::Unset => Ok((next.0 > 0).then_some(progress)),
            // A commit torn mid-write; only the flag itself is left to do.
            _ if next == self.strategy(swap_type)?.last_step() => {
                warn!("Image {}: completing a torn commit", self.image);
                Ok(Some(progress))
            }
            _ => Ok(None),
        }
    }

    /// Look for an interrupted swap.
    pub async fn progress(&mut self) -> Result<Option<Progress>, Error> {
        if let Some(progress) = self.progress_in(self.slots.primary).await? {
            return Ok(Some(progress));
        }
        if let SwapMode::Scratch { scratch } = self.mode {
            return self.progress_in(scratch).await;
        }
        Ok(None)
    }

    /// Whether `info` has been carried out completely and nothing new is staged.
    async fn is_complete(&mut self, info: SwapInfo) -> Result<bool, Error> {
        let primary = trailer::read_trailer(self.device, self.slots.primary).await?;
        let done = primary.is_some_and(|state| {
            state.magic == Magic::Good
                && state.copy_done == trailer::Flag::Set
                && state.swap_info == info
        });
        if !done {
            return Ok(false);
        }

        let secondary = trailer::read_trailer(self.device, self.slots.secondary).await?;
        Ok(secondary.and_then(|state| state.request()).is_none())
    }

    /// Check the incoming image without touching flash.
    async fn validate<V: ImageValidator>(
        &mut self,
        validator: &mut V,
        strategy: &SwapStrategy,
    ) -> Result<bool, Error> {
        let slot = self.slots.secondary;
        let offset = strategy.secondary_image_offset();

        let header = match header::load_header_at(self.device, slot, offset).await {
            Ok(header) => header,
            Err(Error::BadImage) => return Ok(false),
            Err(e) => return Err(e),
        };
        if header
            .total_size()
            .is_none_or(|size| size > strategy.max_image_size())
        {
            warn!("Image in slot {} does not fit the primary slot", slot.0);
            return Ok(false);
        }

        validate::accepts(validator, self.device, slot, offset, &header).await
    }

    /// Persist a revert in the secondary trailer, such that it survives erasing the primary trailer.
    async fn stage_revert(&mut self, info: SwapInfo) -> Result<(), Error> {
        let slot = self.slots.secondary;
        let layout = self.layout(slot)?;

        let state = trailer::read_with(self.device, slot, &layout).await?;
        if state.magic == Magic::Good && state.swap_info == info {
            return Ok(());
        }
        if !trailer::is_erased(self.device, slot, &layout).await? {
            trailer::erase(self.device, slot, &layout).await?;
        }

        trailer::write_swap_info(self.device, slot, &layout, info).await?;
        trailer::write_magic(self.device, slot, &layout).await
    }

    /// Record that `step` has been carried out.
    async fn record(
        &mut self,
        strategy: &SwapStrategy,
        info: SwapInfo,
        step: Step,
    ) -> Result<(), Error> {
        let slot = strategy.status_slot(step);
        let layout = self.layout(slot)?;

        let state = trailer::read_with(self.device, slot, &layout).await?;
        if state.magic == Magic::Good {
            return trailer::write_status(self.device, slot, &layout, step).await;
        }

        debug!("Creating trailer in slot {} at step {}", slot.0, step.0);
        trailer::write_swap_size(self.device, slot, &layout, strategy.max_image_size()).await?;
        trailer::write_swap_info(self.device, slot, &layout, info).await?;
        for done in 0..=step.0 {
            trailer::write_status(self.device, slot, &layout, Step(done)).await?;
        }
        trailer::write_magic(self.device, slot, &layout).await
    }

    /// Clean up the helper trailers and commit the swap.
    async fn complete(&mut self, strategy: &SwapStrategy, swap_type: SwapType) -> Result<(), Error> {
        if let SwapMode::Scratch { scratch } = self.mode {
            let layout = self.layout(scratch)?;
            if !trailer::is_erased(self.device, scratch, &layout).await? {
                trailer::erase(self.device, scratch, &layout).await?;
            }
        }

        if !strategy.shares_trailer_sector() {
            let slot = self.slots.secondary;
            let layout = self.layout(slot)?;
            if !trailer::is_erased(self.device, slot, &layout).await? {
                trailer::erase(self.device, slot, &layout).await?;
            }
        }

        let slot = self.slots.primary;
        let layout = self.layout(slot)?;
        if matches!(swap_type, SwapType::Permanent | SwapType::Revert) {
            trailer::write_flag(self.device, slot, &layout, FlagField::ImageOk).await?;
        }
        trailer::write_flag(self.device, slot, &layout, FlagField::CopyDone).await
    }

    /// Carry out `swap_type`, resuming an interrupted swap if there is one.
    ///
    /// Returns [`SwapType::Fail`] without touching flash if the incoming image is rejected, and
    /// `swap_type` otherwise.
    pub async fn run<V: ImageValidator>(
        &mut self,
        validator: &mut V,
        swap_type: SwapType,
    ) -> Result<SwapType, Error> {
        let info = SwapInfo::new(self.image, swap_type).ok_or(Error::BadArgs)?;
        let strategy = self.strategy(swap_type)?;

        let start = match self.progress().await? {
            Some(progress) if progress.swap_type != swap_type => {
                warn!(
                    "Swap {:?} in progress, refusing {:?}",
                    progress.swap_type, swap_type
                );
                return Err(Error::BadStatus);
            }
            Some(progress) => {
                info!(
                    "Resuming {:?} of image {} at step {}",
                    swap_type, self.image, progress.next.0
                );
                progress.next
            }
            None => {
                if self.is_complete(info).await? {
                    debug!("{:?} of image {} already done", swap_type, self.image);
                    return Ok(swap_type);
                }

                if matches!(swap_type, SwapType::Test | SwapType::Permanent)
                    && !self.validate(validator, &strategy).await?
                {
                    warn!("Image {} rejected, not swapping", self.image);
                    return Ok(SwapType::Fail);
                }

                if !strategy.shares_trailer_sector() {
                    if swap_type == SwapType::Revert {
                        self.stage_revert(info).await?;
                    }
                    let layout = self.layout(self.slots.primary)?;
                    trailer::erase(self.device, self.slots.primary, &layout).await?;
                }

                info!("Starting {:?} of image {}", swap_type, self.image);
                Step(0)
            }
        };

        let last = strategy.last_step();
        if start > last {
            warn!("Progress beyond the last step {}", last.0);
            return Err(Error::BadStatus);
        }

        let body = self.body();
        for step in start.0..last.0 {
            let step = Step(step);
            area::copy(self.device, strategy.plan(step), body).await?;
            self.record(&strategy, info, step).await?;
        }

        self.complete(&strategy, swap_type).await?;
        info!("{:?} of image {} complete", swap_type, self.image);
        Ok(swap_type)
    }
}
