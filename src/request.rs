//! Requests from the running application, expressed as trailer writes picked up on the next boot.

use defmt_or_log::{debug, info, warn};

use crate::{
    Bootloader, Device, Error, Slot, area, header,
    trailer::{self, FlagField, Magic, SwapInfo, SwapType, TrailerLayout},
};

impl<D: Device> Bootloader<'_, D> {
    /// Request a swap to the image staged in the secondary slot of `image`.
    ///
    /// Without `permanent`, the image is test booted once and reverted on the following boot
    /// unless it confirms itself.
    pub async fn set_pending(&mut self, image: u8, permanent: bool) -> Result<(), Error> {
        let slots = self.slots(image)?;
        let offset = self.secondary_image_offset(image)?;

        header::load_header_at(self.device, slots.secondary, offset)
            .await
            .inspect_err(|_| warn!("No valid image staged for image {}", image))?;

        self.set_next(slots.secondary, false, permanent).await
    }

    /// Mark the image running from the primary slot of `image` as good.
    pub async fn set_confirmed(&mut self, image: u8) -> Result<(), Error> {
        let slots = self.slots(image)?;
        self.set_next(slots.primary, true, true).await
    }

    /// Designate `slot` to be booted next.
    ///
    /// `active` tells whether `slot` holds the running image, in which case it can only be confirmed.
    pub async fn set_next(&mut self, slot: Slot, active: bool, confirm: bool) -> Result<(), Error> {
        let image = self.image_of(slot).ok_or(Error::BadArgs)?;
        let confirm = confirm || active;

        let layout = TrailerLayout::fields(self.device, slot)?;
        if !layout.fits() {
            return Err(Error::BadArgs);
        }
        let state = trailer::read_with(self.device, slot, &layout).await?;

        match state.magic {
            Magic::Good => {
                if active && state.image_ok != trailer::Flag::Set {
                    info!("Confirming image in slot {}", slot.0);
                    // Fails on a flag that cannot be completed by programming.
                    trailer::write_flag(self.device, slot, &layout, FlagField::ImageOk).await?;
                }
                Ok(())
            }
            // Running image without a trailer, nothing to confirm.
            Magic::Unset if active => Ok(()),
            Magic::Unset => {
                let swap_type = if confirm {
                    SwapType::Permanent
                } else {
                    SwapType::Test
                };
                let info = SwapInfo::new(image, swap_type).ok_or(Error::BadArgs)?;
                info!("Requesting {:?} of slot {}", swap_type, slot.0);

                if confirm {
                    trailer::write_flag(self.device, slot, &layout, FlagField::ImageOk).await?;
                }
                trailer::write_swap_info(self.device, slot, &layout, info).await?;
                trailer::write_magic(self.device, slot, &layout).await
            }
            Magic::Bad if active => {
                warn!("Running image in slot {} has a corrupt trailer", slot.0);
                Err(Error::BadVector)
            }
            Magic::Bad => {
                debug!("Erasing slot {} with a corrupt trailer", slot.0);
                let size = area::size(self.device, slot)?;
                area::erase(self.device, slot, 0, size).await?;
                Err(Error::BadImage)
            }
        }
    }
}
