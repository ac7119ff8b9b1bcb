//! Trailer codec: the fixed-layout metadata record at the end of every slot.
//!
//! Layout, from the end of the area backwards, each field padded to the alignment unit:
//!
//! ```text
//! | status markers | swap_size | swap_info | copy_done | image_ok | magic |
//! ```
//!
//! Flash can only clear bits between erases, so every field is written at most once and the trailer is
//! reset solely by erasing the sector holding it. Decoding never fails on malformed bytes: unexpected
//! values decode to `Bad` or [`SwapInfo::Invalid`] so the decision logic can react to them.

use defmt_or_log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::{
    Device, Error, Sector, Slot, Step,
    area::{self, ERASED},
};

/// Sentinel marking a trailer as present.
pub const MAGIC: [u8; 16] = [
    0x77, 0xc2, 0x95, 0xf3, 0x60, 0xd2, 0xef, 0x7f, 0x35, 0x52, 0x50, 0x0f, 0x2c, 0xb6, 0x79, 0x80,
];

/// Tail of the sentinel used when the alignment unit exceeds the sentinel size.
/// The first two bytes then hold the alignment in little endian.
const MAGIC_ALT_TAIL: [u8; 14] = [
    0x2d, 0xe1, 0x5d, 0x29, 0x41, 0x0b, 0x8d, 0x77, 0x67, 0x9c, 0x11, 0x0f, 0x1f, 0x8a,
];

pub const MAGIC_SIZE: u32 = 16;

/// Bounds for the alignment unit of trailer fields.
const MIN_ALIGN: u32 = 8;
pub(crate) const MAX_ALIGN: u32 = 32;

/// On-flash value of [`Flag::Set`] and of a progress marker.
const FLAG_SET: u8 = 0x01;

/// Progress markers reserved per sector of the slot.
pub(crate) const MARKERS_PER_SECTOR: u32 = 3;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Magic {
    /// The sentinel is present.
    Good,
    /// Neither the sentinel nor erased memory.
    Bad,
    /// Erased memory.
    Unset,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Flag {
    Set,
    Bad,
    Unset,
}

/// Action taken on an image pair.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapType {
    /// Boot the primary slot as is.
    None,
    /// Swap to the secondary slot, revert on the next boot unless confirmed.
    Test,
    /// Swap to the secondary slot and keep it.
    Permanent,
    /// Swap back after an unconfirmed test boot.
    Revert,
    /// The image to be run is not valid.
    Fail,
    /// Trailer contents are inconsistent, do not boot.
    Panic,
}

impl SwapType {
    /// Numeric value compatible with the C interface.
    pub const fn code(self) -> u8 {
        match self {
            SwapType::None => 1,
            SwapType::Test => 2,
            SwapType::Permanent => 3,
            SwapType::Revert => 4,
            SwapType::Fail => 5,
            SwapType::Panic => 0xff,
        }
    }

    /// Whether this type moves data between the slots.
    pub const fn is_swap(self) -> bool {
        matches!(
            self,
            SwapType::Test | SwapType::Permanent | SwapType::Revert
        )
    }
}

/// Decoded `swap_info` byte: image index in the high nibble, swap type in the low nibble.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SwapInfo {
    /// Erased, or explicitly no swap.
    Unset,
    Test { image: u8 },
    Permanent { image: u8 },
    Revert { image: u8 },
    /// A value none of the writers produce.
    Invalid(u8),
}

impl SwapInfo {
    /// Build the record for a swap type that can be persisted.
    pub const fn new(image: u8, swap_type: SwapType) -> Option<Self> {
        if image >= 0x0f {
            return None;
        }
        match swap_type {
            SwapType::Test => Some(SwapInfo::Test { image }),
            SwapType::Permanent => Some(SwapInfo::Permanent { image }),
            SwapType::Revert => Some(SwapInfo::Revert { image }),
            _ => None,
        }
    }

    pub const fn decode(byte: u8) -> Self {
        if byte == ERASED {
            return SwapInfo::Unset;
        }
        let image = byte >> 4;
        match byte & 0x0f {
            1 => SwapInfo::Unset,
            2 => SwapInfo::Test { image },
            3 => SwapInfo::Permanent { image },
            4 => SwapInfo::Revert { image },
            _ => SwapInfo::Invalid(byte),
        }
    }

    pub const fn encode(self) -> u8 {
        match self {
            SwapInfo::Unset => ERASED,
            SwapInfo::Test { image } => (image << 4) | SwapType::Test.code(),
            SwapInfo::Permanent { image } => (image << 4) | SwapType::Permanent.code(),
            SwapInfo::Revert { image } => (image << 4) | SwapType::Revert.code(),
            SwapInfo::Invalid(byte) => byte,
        }
    }

    pub const fn swap_type(self) -> SwapType {
        match self {
            SwapInfo::Unset => SwapType::None,
            SwapInfo::Test { .. } => SwapType::Test,
            SwapInfo::Permanent { .. } => SwapType::Permanent,
            SwapInfo::Revert { .. } => SwapType::Revert,
            SwapInfo::Invalid(_) => SwapType::Panic,
        }
    }

    pub const fn image(self) -> Option<u8> {
        match self {
            SwapInfo::Test { image }
            | SwapInfo::Permanent { image }
            | SwapInfo::Revert { image } => Some(image),
            SwapInfo::Unset | SwapInfo::Invalid(_) => None,
        }
    }
}

/// Decoded contents of a trailer.
///
/// Only with a [`Magic::Good`] are the other fields meaningful.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SwapState {
    pub magic: Magic,
    pub swap_info: SwapInfo,
    pub copy_done: Flag,
    pub image_ok: Flag,
}

impl SwapState {
    /// State of an erased trailer.
    pub const UNSET: SwapState = SwapState {
        magic: Magic::Unset,
        swap_info: SwapInfo::Unset,
        copy_done: Flag::Unset,
        image_ok: Flag::Unset,
    };

    /// Image index this trailer belongs to, if it records a swap.
    pub const fn image_num(&self) -> Option<u8> {
        self.swap_info.image()
    }

    /// Swap recorded in a valid trailer.
    pub fn request(&self) -> Option<SwapType> {
        let swap_type = self.swap_info.swap_type();
        (self.magic == Magic::Good && swap_type.is_swap()).then_some(swap_type)
    }
}

/// Which one-byte flag of the trailer to address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlagField {
    CopyDone,
    ImageOk,
}

/// Offsets of the trailer fields within an area.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TrailerLayout {
    area_size: u32,
    align: u32,
    write_size: u32,
    markers: u32,
}

impl TrailerLayout {
    /// Layout for an area of `area_size` bytes with room for the progress of `sectors` sectors.
    pub fn new(area_size: u32, write_size: u32, sectors: u16) -> Result<Self, Error> {
        let align = u32::max(MIN_ALIGN, write_size);
        if !write_size.is_power_of_two() || align > MAX_ALIGN {
            return Err(Error::BadArgs);
        }
        Ok(Self {
            area_size,
            align,
            write_size,
            markers: u32::from(sectors) * MARKERS_PER_SECTOR,
        })
    }

    /// Layout of the fixed fields only, for areas whose progress is of no interest.
    pub(crate) fn fields<D: Device>(device: &mut D, slot: Slot) -> Result<Self, Error> {
        Self::new(area::size(device, slot)?, area::write_size::<D>(), 0)
    }

    const fn magic_field(&self) -> u32 {
        MAGIC_SIZE.div_ceil(self.align) * self.align
    }

    /// Size of the trailer in bytes, progress markers included.
    pub const fn size(&self) -> u32 {
        self.magic_field() + 4 * self.align + self.markers * self.write_size
    }

    /// Number of progress markers the trailer holds.
    pub const fn capacity(&self) -> u32 {
        self.markers
    }

    /// Whether the area is large enough to hold the trailer plus one alignment unit.
    pub const fn fits(&self) -> bool {
        self.area_size >= self.size() + self.align
    }

    pub const fn offset(&self) -> u32 {
        self.area_size - self.size()
    }

    const fn magic_off(&self) -> u32 {
        self.area_size - self.magic_field()
    }

    const fn flag_off(&self, field: FlagField) -> u32 {
        match field {
            FlagField::ImageOk => self.magic_off() - self.align,
            FlagField::CopyDone => self.magic_off() - 2 * self.align,
        }
    }

    const fn swap_info_off(&self) -> u32 {
        self.magic_off() - 3 * self.align
    }

    const fn swap_size_off(&self) -> u32 {
        self.magic_off() - 4 * self.align
    }

    const fn marker_off(&self, step: Step) -> u32 {
        self.offset() + step.0 as u32 * self.write_size
    }

    /// First sector touched by the trailer.
    pub fn first_sector(&self, sector_size: u32) -> Sector {
        Sector((self.offset() / sector_size) as u16)
    }

    /// The sentinel as it is laid out in the magic field.
    fn magic(&self, out: &mut [u8; MAX_ALIGN as usize]) -> usize {
        let len = self.magic_field() as usize;
        out[..len].fill(ERASED);
        let sentinel = &mut out[len - MAGIC_SIZE as usize..len];
        if self.align <= MAGIC_SIZE {
            sentinel.copy_from_slice(&MAGIC);
        } else {
            sentinel[..2].copy_from_slice(&(self.align as u16).to_le_bytes());
            sentinel[2..].copy_from_slice(&MAGIC_ALT_TAIL);
        }
        len
    }
}

fn decode_flag(byte: u8) -> Flag {
    match byte {
        FLAG_SET => Flag::Set,
        ERASED => Flag::Unset,
        _ => Flag::Bad,
    }
}

fn decode_magic(layout: &TrailerLayout, bytes: &[u8]) -> Magic {
    let mut expected = [0u8; MAX_ALIGN as usize];
    let len = layout.magic(&mut expected);
    let sentinel = &expected[len - MAGIC_SIZE as usize..len];
    if bytes == sentinel {
        Magic::Good
    } else if bytes.iter().all(|b| *b == ERASED) {
        Magic::Unset
    } else {
        Magic::Bad
    }
}

async fn read_byte<D: Device>(device: &mut D, slot: Slot, offset: u32) -> Result<u8, Error> {
    let mut byte = [0u8; 1];
    area::read(device, slot, offset, &mut byte).await?;
    Ok(byte[0])
}

pub(crate) async fn read_with<D: Device>(
    device: &mut D,
    slot: Slot,
    layout: &TrailerLayout,
) -> Result<SwapState, Error> {
    let mut magic = [0u8; MAGIC_SIZE as usize];
    area::read(device, slot, layout.area_size - MAGIC_SIZE, &mut magic).await?;

    Ok(SwapState {
        magic: decode_magic(layout, &magic),
        swap_info: SwapInfo::decode(read_byte(device, slot, layout.swap_info_off()).await?),
        copy_done: decode_flag(read_byte(device, slot, layout.flag_off(FlagField::CopyDone)).await?),
        image_ok: decode_flag(read_byte(device, slot, layout.flag_off(FlagField::ImageOk)).await?),
    })
}

/// Read and decode the trailer of `slot`, whatever state it is in.
pub async fn read_swap_state<D: Device>(device: &mut D, slot: Slot) -> Result<SwapState, Error> {
    let layout = TrailerLayout::fields(device, slot)?;
    if !layout.fits() {
        return Err(Error::BadArgs);
    }
    read_with(device, slot, &layout).await
}

/// Read the trailer of `slot`, returning `None` if there is none.
///
/// A trailer is absent if its magic is erased or the area cannot hold one.
pub async fn read_trailer<D: Device>(
    device: &mut D,
    slot: Slot,
) -> Result<Option<SwapState>, Error> {
    let layout = TrailerLayout::fields(device, slot)?;
    if !layout.fits() {
        return Ok(None);
    }
    let state = read_with(device, slot, &layout).await?;
    Ok((state.magic != Magic::Unset).then_some(state))
}

/// Number of contiguous progress markers, i.e. the next step to execute.
pub(crate) async fn read_status<D: Device>(
    device: &mut D,
    slot: Slot,
    layout: &TrailerLayout,
) -> Result<Step, Error> {
    let mut step = 0;
    while step < layout.capacity() {
        let byte = read_byte(device, slot, layout.marker_off(Step(step as u16))).await?;
        if byte != FLAG_SET {
            break;
        }
        step += 1;
    }
    Ok(Step(step as u16))
}

/// Write a field unless it already holds `value`.
///
/// A field whose programming was cut short holds a superset of the bits of `value` and is programmed
/// again. Any other content means the field was written before with another value, which cannot be
/// overwritten without an erase.
async fn write_field<D: Device>(
    device: &mut D,
    slot: Slot,
    offset: u32,
    value: &[u8],
) -> Result<(), Error> {
    let mut current = [0u8; MAX_ALIGN as usize];
    let current = &mut current[..value.len()];
    area::read(device, slot, offset, current).await?;

    if current == value {
        return Ok(());
    }
    if !completes(current, value) {
        warn!("Trailer field at {} in slot {} already written", offset, slot.0);
        return Err(Error::BadStatus);
    }
    area::write(device, slot, offset, value).await
}

/// Whether programming `value` over `current` only clears bits.
fn completes(current: &[u8], value: &[u8]) -> bool {
    current.iter().zip(value).all(|(c, v)| c & v == *v)
}

async fn write_unit<D: Device>(
    device: &mut D,
    slot: Slot,
    layout: &TrailerLayout,
    offset: u32,
    prefix: &[u8],
) -> Result<(), Error> {
    let mut unit = [ERASED; MAX_ALIGN as usize];
    unit[..prefix.len()].copy_from_slice(prefix);
    write_field(device, slot, offset, &unit[..layout.align as usize]).await
}

pub(crate) async fn write_magic<D: Device>(
    device: &mut D,
    slot: Slot,
    layout: &TrailerLayout,
) -> Result<(), Error> {
    let mut magic = [0u8; MAX_ALIGN as usize];
    let len = layout.magic(&mut magic);
    debug!("Writing magic to slot {}", slot.0);
    write_field(device, slot, layout.magic_off(), &magic[..len]).await
}

pub(crate) async fn write_swap_info<D: Device>(
    device: &mut D,
    slot: Slot,
    layout: &TrailerLayout,
    info: SwapInfo,
) -> Result<(), Error> {
    debug!("Writing swap info {:?} to slot {}", info, slot.0);
    write_unit(device, slot, layout, layout.swap_info_off(), &[info.encode()]).await
}

pub(crate) async fn write_swap_size<D: Device>(
    device: &mut D,
    slot: Slot,
    layout: &TrailerLayout,
    size: u32,
) -> Result<(), Error> {
    write_unit(device, slot, layout, layout.swap_size_off(), &size.to_le_bytes()).await
}

pub(crate) async fn write_flag<D: Device>(
    device: &mut D,
    slot: Slot,
    layout: &TrailerLayout,
    field: FlagField,
) -> Result<(), Error> {
    debug!("Setting {:?} in slot {}", field, slot.0);
    write_unit(device, slot, layout, layout.flag_off(field), &[FLAG_SET]).await
}

/// Record completion of `step`.
pub(crate) async fn write_status<D: Device>(
    device: &mut D,
    slot: Slot,
    layout: &TrailerLayout,
    step: Step,
) -> Result<(), Error> {
    if u32::from(step.0) >= layout.capacity() {
        return Err(Error::BadStatus);
    }
    let mut unit = [ERASED; MAX_ALIGN as usize];
    unit[0] = FLAG_SET;
    write_field(
        device,
        slot,
        layout.marker_off(step),
        &unit[..layout.write_size as usize],
    )
    .await
}

/// Whether the whole trailer region reads back erased.
pub(crate) async fn is_erased<D: Device>(
    device: &mut D,
    slot: Slot,
    layout: &TrailerLayout,
) -> Result<bool, Error> {
    area::is_erased(device, slot, layout.offset(), layout.size()).await
}

/// Erase every sector the trailer touches.
///
/// Only valid for areas where those sectors carry no image content.
pub(crate) async fn erase<D: Device>(
    device: &mut D,
    slot: Slot,
    layout: &TrailerLayout,
) -> Result<(), Error> {
    let sector_size = area::sector_size::<D>();
    let from = layout.first_sector(sector_size).0 as u32 * sector_size;
    debug!("Erasing trailer of slot {}", slot.0);
    area::erase(device, slot, from, layout.area_size).await
}
