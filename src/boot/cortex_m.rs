use crate::boot::Boot;

/// Jump through the vector table at the image entry, for Cortex-M without TrustZone.
///
/// Points VTOR at the image's vector table, then loads the stack pointer and reset vector from it.
/// Peripherals are left as they are.
pub struct SimpleCortexM;

impl Boot for SimpleCortexM {
    unsafe fn boot(entry: *const u32) -> ! {
        unsafe {
            (*cortex_m::peripheral::SCB::PTR).vtor.write(entry as u32);
            cortex_m::asm::dsb();
            cortex_m::asm::isb();
            cortex_m::asm::bootload(entry)
        }
    }
}
