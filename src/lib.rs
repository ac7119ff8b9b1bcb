//! Swap engine for building your own upgrade-capable bootloader.
//!
//! Upgrade intent and progress live in small trailers at the end of every image slot.
//! On each boot the trailers are read back, a swap action is decided upon and, if required,
//! executed sector by sector such that a power cut at any point can be resumed on the next boot.
#![no_std]

use core::fmt;

use embedded_storage_async::nor_flash::NorFlash;
use serde::{Deserialize, Serialize};

pub mod boot;
pub mod bootloader;
pub mod decision;
pub mod executor;
pub mod header;
pub mod ram;
pub mod request;
pub mod share;
pub mod strategies;
pub mod trailer;
pub mod validate;

mod area;

pub use bootloader::{BootResponse, Bootloader, Config, ImageSlots, SwapMode};
pub use trailer::{Flag, Magic, SwapInfo, SwapState, SwapType};

#[cfg(test)]
extern crate std;

#[cfg(test)]
mod mock;

/// Failure kinds reported by every fallible operation.
///
/// The set is closed and maps one-to-one onto the negative status codes of [`Error::code`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// Underlying flash read, write or erase failed.
    Flash,
    /// Requested slot or area does not exist.
    File,
    /// Image is structurally invalid or was rejected by the validator.
    BadImage,
    /// Header or vector table of a running image is unusable.
    BadVector,
    /// Persisted trailer or progress state is inconsistent.
    BadStatus,
    /// A buffer was too small.
    NoMem,
    /// Caller passed arguments that do not fit the configuration.
    BadArgs,
    /// Image version is unacceptable.
    BadVersion,
    /// Sector specific flash failure.
    FlashSector,
}

impl Error {
    /// Negative status code compatible with the C interface.
    pub const fn code(self) -> i32 {
        match self {
            Error::Flash => -1,
            Error::File => -2,
            Error::BadImage => -3,
            Error::BadVector => -4,
            Error::BadStatus => -5,
            Error::NoMem => -6,
            Error::BadArgs => -7,
            Error::BadVersion => -8,
            Error::FlashSector => -9,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Error::Flash => "flash operation failed",
            Error::File => "no such slot",
            Error::BadImage => "bad image",
            Error::BadVector => "bad vector",
            Error::BadStatus => "bad swap status",
            Error::NoMem => "out of memory",
            Error::BadArgs => "bad arguments",
            Error::BadVersion => "bad version",
            Error::FlashSector => "flash sector failure",
        };
        f.write_str(msg)
    }
}

/// Representation of a concrete device, mapping image slots onto flash areas.
///
/// All areas share one flash type and thereby one sector (erase) size and write granularity.
/// Flash only allows clearing bits between erases; the engine never relies on anything more.
pub trait Device {
    type Flash: NorFlash;

    /// Flash area backing `slot`, if the device has one.
    fn area(&mut self, slot: Slot) -> Option<&mut Self::Flash>;
}

/// Flash area identifier with regards to the bootloader.
///
/// Primary, secondary and scratch areas are all addressed through a slot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Slot(pub u8);

/// Erasable unit within a slot, as described by [`NorFlash::ERASE_SIZE`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Sector(pub u16);

/// Step number of a specific strategy that has to be or has been executed.
///
/// What operation this step entails can be extracted from the strategy.
/// Step numbers are strictly monotonical.
/// Every step can be interrupted at any time, and after a step has been executed this is recorded as a progress marker.
/// If the step is executed, but not yet recorded, it must be valid to execute the step again.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Step(pub u16);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct MemoryLocation {
    pub slot: Slot,
    pub sector: Sector,
}

/// Part of a sector that a copy moves.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Span {
    /// The whole sector.
    Sector,
    /// Everything up to the trailer, for sectors that end in one.
    Body,
}

/// Erase `to` and copy `from` into it, leaving `from` intact.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CopyOperation {
    pub from: MemoryLocation,
    pub to: MemoryLocation,
    pub span: Span,
}
