//! Boot information handed to the application, for instance through a reserved RAM area.

use serde::{Deserialize, Serialize};

use crate::{
    BootResponse, Error, Slot,
    header::ImageVersion,
    trailer::SwapType,
};

/// What the bootloader did on this boot.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BootInfo {
    pub slot: Slot,
    pub version: ImageVersion,
    pub swap_type: SwapType,
}

impl BootInfo {
    /// Upper bound on the serialized size.
    pub const MAX_SIZE: usize = 32;

    pub fn serialize_into<'b>(&self, buffer: &'b mut [u8]) -> Result<&'b mut [u8], Error> {
        postcard::to_slice(self, buffer).map_err(|e| match e {
            postcard::Error::SerializeBufferFull => Error::NoMem,
            // Unmapped error.
            _ => Error::BadArgs,
        })
    }

    pub fn deserialize_from(buffer: &[u8]) -> Result<Self, Error> {
        postcard::from_bytes(buffer).map_err(|e| match e {
            // Provided buffer is too small.
            postcard::Error::DeserializeUnexpectedEnd => Error::NoMem,
            // Not a record written by this bootloader.
            postcard::Error::DeserializeBadVarint
            | postcard::Error::DeserializeBadBool
            | postcard::Error::DeserializeBadEnum
            | postcard::Error::DeserializeBadEncoding => Error::BadStatus,
            _ => Error::BadArgs,
        })
    }
}

impl From<&BootResponse> for BootInfo {
    fn from(response: &BootResponse) -> Self {
        Self {
            slot: response.slot,
            version: response.header.version,
            swap_type: response.swap_type,
        }
    }
}
