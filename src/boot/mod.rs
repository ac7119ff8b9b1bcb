//! Hand-off from the bootloader to the selected image.

use crate::header::ImageHeader;

#[cfg(feature = "cortex_m")]
pub mod cortex_m;

/// Mechanism to start an image once the bootloader is done with it.
///
/// Implementations may additionally drop privileges or lock down memory before jumping.
pub trait Boot {
    /// Start the image whose body, typically a vector table, begins at `entry`.
    ///
    /// # Safety
    /// `entry` must point to the body of a validated image linked for that address.
    unsafe fn boot(entry: *const u32) -> !;

    /// Start the image described by `header`, placed at address `base`.
    ///
    /// # Safety
    /// The image must be validated and linked to run from `base`.
    unsafe fn boot_image(base: u32, header: &ImageHeader) -> ! {
        unsafe { Self::boot(entry(base, header)) }
    }
}

/// Address of the image body following the header.
pub fn entry(base: u32, header: &ImageHeader) -> *const u32 {
    base.wrapping_add(u32::from(header.hdr_size)) as *const u32
}
