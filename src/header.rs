//! Minimal image header access: enough to know how many bytes belong to an image and whether a slot holds one.

use defmt_or_log::debug;
use serde::{Deserialize, Serialize};

use crate::{Device, Error, Slot, area};

pub const IMAGE_MAGIC: u32 = 0x96f3_b83d;

/// Size of the fixed header structure.
pub const IMAGE_HEADER_SIZE: usize = 32;

/// Image is executed from RAM, at [`ImageHeader::load_addr`].
pub const IMAGE_F_RAM_LOAD: u32 = 0x0000_0020;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageVersion {
    pub major: u8,
    pub minor: u8,
    pub revision: u16,
    pub build_num: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageHeader {
    pub magic: u32,
    /// Destination in RAM, for images flagged [`IMAGE_F_RAM_LOAD`].
    pub load_addr: u32,
    /// Size of the header, the image body starts right after it.
    pub hdr_size: u16,
    pub protect_tlv_size: u16,
    /// Size of the image body, excluding the header.
    pub img_size: u32,
    pub flags: u32,
    pub version: ImageVersion,
}

fn u16_at(data: &[u8; IMAGE_HEADER_SIZE], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn u32_at(data: &[u8; IMAGE_HEADER_SIZE], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

impl ImageHeader {
    pub fn from_bytes(data: &[u8; IMAGE_HEADER_SIZE]) -> Self {
        Self {
            magic: u32_at(data, 0),
            load_addr: u32_at(data, 4),
            hdr_size: u16_at(data, 8),
            protect_tlv_size: u16_at(data, 10),
            img_size: u32_at(data, 12),
            flags: u32_at(data, 16),
            version: ImageVersion {
                major: data[20],
                minor: data[21],
                revision: u16_at(data, 22),
                build_num: u32_at(data, 24),
            },
        }
    }

    pub fn to_bytes(&self) -> [u8; IMAGE_HEADER_SIZE] {
        let mut data = [0u8; IMAGE_HEADER_SIZE];
        data[0..4].copy_from_slice(&self.magic.to_le_bytes());
        data[4..8].copy_from_slice(&self.load_addr.to_le_bytes());
        data[8..10].copy_from_slice(&self.hdr_size.to_le_bytes());
        data[10..12].copy_from_slice(&self.protect_tlv_size.to_le_bytes());
        data[12..16].copy_from_slice(&self.img_size.to_le_bytes());
        data[16..20].copy_from_slice(&self.flags.to_le_bytes());
        data[20] = self.version.major;
        data[21] = self.version.minor;
        data[22..24].copy_from_slice(&self.version.revision.to_le_bytes());
        data[24..28].copy_from_slice(&self.version.build_num.to_le_bytes());
        data
    }

    /// Header plus body, `None` on overflow.
    pub fn total_size(&self) -> Option<u32> {
        self.img_size.checked_add(u32::from(self.hdr_size))
    }

    pub const fn is_ram_load(&self) -> bool {
        self.flags & IMAGE_F_RAM_LOAD != 0
    }

    /// Sanity check the header against the room available for the image.
    pub fn check(&self, room: u32) -> Result<(), Error> {
        if self.magic != IMAGE_MAGIC {
            return Err(Error::BadImage);
        }
        if usize::from(self.hdr_size) < IMAGE_HEADER_SIZE {
            return Err(Error::BadImage);
        }
        match self.total_size() {
            Some(size) if size <= room => Ok(()),
            _ => Err(Error::BadImage),
        }
    }
}

/// Load and sanity check the header of the image at the start of `slot`.
pub async fn load_header<D: Device>(device: &mut D, slot: Slot) -> Result<ImageHeader, Error> {
    load_header_at(device, slot, 0).await
}

/// Load and sanity check the header of an image starting `offset` bytes into `slot`.
///
/// The image must fit in the remainder of the slot. Stricter bounds imposed by a swap strategy are
/// checked by the caller.
pub async fn load_header_at<D: Device>(
    device: &mut D,
    slot: Slot,
    offset: u32,
) -> Result<ImageHeader, Error> {
    let room = area::size(device, slot)?
        .checked_sub(offset)
        .ok_or(Error::BadArgs)?;
    if room < IMAGE_HEADER_SIZE as u32 {
        debug!("No room for an image header in slot {} at {}", slot.0, offset);
        return Err(Error::BadImage);
    }

    let mut data = [0u8; IMAGE_HEADER_SIZE];
    area::read(device, slot, offset, &mut data).await?;
    let header = ImageHeader::from_bytes(&data);

    header.check(room).inspect_err(|_| {
        debug!("No valid image header in slot {} at {}", slot.0, offset);
    })?;
    Ok(header)
}
