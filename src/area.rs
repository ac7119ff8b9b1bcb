//! Thin helpers over the flash areas of a [`Device`], mapping driver errors onto [`Error::Flash`].

use defmt_or_log::error;
use embedded_storage_async::nor_flash::{NorFlash, ReadNorFlash};

use crate::{CopyOperation, Device, Error, Sector, Slot, Span};

/// Value of a byte after erasure.
pub(crate) const ERASED: u8 = 0xff;

/// Copies go through RAM in chunks of this size.
const CHUNK: usize = 256;

pub(crate) const fn sector_size<D: Device>() -> u32 {
    <D::Flash as NorFlash>::ERASE_SIZE as u32
}

pub(crate) const fn write_size<D: Device>() -> u32 {
    <D::Flash as NorFlash>::WRITE_SIZE as u32
}

fn area<D: Device>(device: &mut D, slot: Slot) -> Result<&mut D::Flash, Error> {
    device.area(slot).ok_or(Error::File)
}

fn flash_error(slot: Slot) -> Error {
    error!("Flash operation failed on slot {}", slot.0);
    Error::Flash
}

pub(crate) fn size<D: Device>(device: &mut D, slot: Slot) -> Result<u32, Error> {
    Ok(area(device, slot)?.capacity() as u32)
}

pub(crate) fn sector_count<D: Device>(device: &mut D, slot: Slot) -> Result<u16, Error> {
    let sectors = size(device, slot)? / sector_size::<D>();
    u16::try_from(sectors).map_err(|_| Error::BadArgs)
}

pub(crate) async fn read<D: Device>(
    device: &mut D,
    slot: Slot,
    offset: u32,
    bytes: &mut [u8],
) -> Result<(), Error> {
    area(device, slot)?
        .read(offset, bytes)
        .await
        .map_err(|_| flash_error(slot))
}

pub(crate) async fn write<D: Device>(
    device: &mut D,
    slot: Slot,
    offset: u32,
    bytes: &[u8],
) -> Result<(), Error> {
    area(device, slot)?
        .write(offset, bytes)
        .await
        .map_err(|_| flash_error(slot))
}

pub(crate) async fn erase<D: Device>(
    device: &mut D,
    slot: Slot,
    from: u32,
    to: u32,
) -> Result<(), Error> {
    area(device, slot)?
        .erase(from, to)
        .await
        .map_err(|_| flash_error(slot))
}

pub(crate) async fn erase_sector<D: Device>(
    device: &mut D,
    slot: Slot,
    sector: Sector,
) -> Result<(), Error> {
    let from = u32::from(sector.0) * sector_size::<D>();
    erase(device, slot, from, from + sector_size::<D>()).await
}

/// Whether `len` bytes from `offset` all read back as erased.
pub(crate) async fn is_erased<D: Device>(
    device: &mut D,
    slot: Slot,
    offset: u32,
    len: u32,
) -> Result<bool, Error> {
    let mut buf = [0u8; CHUNK];
    let mut done = 0;
    while done < len {
        let n = u32::min(CHUNK as u32, len - done);
        let chunk = &mut buf[..n as usize];
        read(device, slot, offset + done, chunk).await?;
        if chunk.iter().any(|b| *b != ERASED) {
            return Ok(false);
        }
        done += n;
    }
    Ok(true)
}

/// Perform a [`CopyOperation`]. `body` is the length of [`Span::Body`].
///
/// Chunks that read back erased are not programmed.
pub(crate) async fn copy<D: Device>(
    device: &mut D,
    operation: CopyOperation,
    body: u32,
) -> Result<(), Error> {
    let sector = sector_size::<D>();
    let len = match operation.span {
        Span::Sector => sector,
        Span::Body => body,
    };
    let from = u32::from(operation.from.sector.0) * sector;
    let to = u32::from(operation.to.sector.0) * sector;

    erase_sector(device, operation.to.slot, operation.to.sector).await?;

    let mut buf = [0u8; CHUNK];
    let mut done = 0;
    while done < len {
        let n = u32::min(CHUNK as u32, len - done);
        let chunk = &mut buf[..n as usize];
        read(device, operation.from.slot, from + done, chunk).await?;
        if chunk.iter().any(|b| *b != ERASED) {
            write(device, operation.to.slot, to + done, chunk).await?;
        }
        done += n;
    }
    Ok(())
}
