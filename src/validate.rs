//! Seam for checking image content before it is trusted.

use crate::{Device, Error, Slot, header::ImageHeader};

/// Decides whether an image may be booted or swapped in.
///
/// The engine has already sanity checked the header; implementations typically verify a digest or
/// signature over the image read through [`Device::area`]. Any error is a rejection, except
/// [`Error::Flash`] which is propagated as a storage fault.
#[allow(async_fn_in_trait)]
pub trait ImageValidator {
    /// Validate the image starting `offset` bytes into `slot`.
    async fn validate<D: Device>(
        &mut self,
        device: &mut D,
        slot: Slot,
        offset: u32,
        header: &ImageHeader,
    ) -> Result<(), Error>;
}

/// Accepts every image with a sane header.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderOnly;

impl ImageValidator for HeaderOnly {
    async fn validate<D: Device>(
        &mut self,
        _device: &mut D,
        _slot: Slot,
        _offset: u32,
        _header: &ImageHeader,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Run `validator`, turning a rejection into `false`.
pub(crate) async fn accepts<D: Device, V: ImageValidator>(
    validator: &mut V,
    device: &mut D,
    slot: Slot,
    offset: u32,
    header: &ImageHeader,
) -> Result<bool, Error> {
    match validator.validate(device, slot, offset, header).await {
        Ok(()) => Ok(true),
        Err(e @ (Error::Flash | Error::FlashSector)) => Err(e),
        Err(_) => Ok(false),
    }
}
