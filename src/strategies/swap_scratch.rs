//! Strategy to swap two slots using 'S <- A <- B <- S', one sector at a time.
//!
//! In other bootloaders also called 'swap scratch'.
//! It employs a single 'scratch' sector as a temporary buffer.
//!
//! The primary (A) sector is first copied over to the scratch sector (S), before writing the secondary (B) sector to the primary (A) sector.
//! Finally the scratch (S) sector is written to the secondary (B) sector.
//!
//! Sectors are handled from the last one downwards. The last sector of each slot also carries the trailer, so
//! only its body is moved, and the trailer region of every destination is left erased.
//! As the primary trailer does not exist yet after the first step, that step is recorded in the scratch trailer.
//!
//! This results in the primary and secondary slots enduring a single erasure on every sector, whilst the scratch sector endures `N` erasures, where `N` is the number of sectors.

use crate::{
    CopyOperation, Error, ImageSlots, MemoryLocation, Sector, Slot, Span, Step,
    strategies::{Geometry, Strategy},
};

#[derive(Clone, Debug)]
pub struct SwapScratch {
    num_sectors: u16,
    sector_size: u32,
    /// Bytes of the last sector in front of the trailer.
    body: u32,
    slot_primary: Slot,
    slot_secondary: Slot,
    slot_scratch: Slot,
}

/// Logical phases for the strategy to execute, to decouple raw steps from behaviour in a logical manner.
#[derive(Debug)]
enum Phase {
    A2S,
    B2A,
    S2B,
}

impl Phase {
    /// Get the phase and the slot sector it concerns from the step number.
    pub const fn from_step(step: Step, num_sectors: u16) -> (Phase, Sector) {
        let phase = match step.0 % 3 {
            0 => Phase::A2S,
            1 => Phase::B2A,
            2 => Phase::S2B,
            _ => unreachable!(),
        };

        (phase, Sector(num_sectors - 1 - step.0 / 3))
    }
}

impl SwapScratch {
    pub fn new(slots: ImageSlots, scratch: Slot, geometry: Geometry) -> Result<Self, Error> {
        if geometry.primary_sectors != geometry.secondary_sectors
            || geometry.primary_sectors == 0
            || geometry.scratch_sectors != 1
            || geometry.trailer_size >= geometry.sector_size
        {
            return Err(Error::BadArgs);
        }

        Ok(Self {
            num_sectors: geometry.primary_sectors,
            sector_size: geometry.sector_size,
            body: geometry.sector_size - geometry.trailer_size,
            slot_primary: slots.primary,
            slot_secondary: slots.secondary,
            slot_scratch: scratch,
        })
    }
}

impl Strategy for SwapScratch {
    fn last_step(&self) -> Step {
        // A step for each AS, BA and SB step.
        Step(self.num_sectors * 3)
    }

    fn plan(&self, step: Step) -> CopyOperation {
        let (phase, sector) = Phase::from_step(step, self.num_sectors);

        let primary = MemoryLocation {
            slot: self.slot_primary,
            sector,
        };
        let secondary = MemoryLocation {
            slot: self.slot_secondary,
            sector,
        };
        let scratch = MemoryLocation {
            slot: self.slot_scratch,
            sector: Sector(0),
        };

        let (from, to) = match phase {
            Phase::A2S => (primary, scratch),
            Phase::B2A => (secondary, primary),
            Phase::S2B => (scratch, secondary),
        };

        let span = if sector.0 == self.num_sectors - 1 {
            Span::Body
        } else {
            Span::Sector
        };

        CopyOperation { from, to, span }
    }

    fn status_slot(&self, step: Step) -> Slot {
        if step == Step(0) {
            self.slot_scratch
        } else {
            self.slot_primary
        }
    }

    fn shares_trailer_sector(&self) -> bool {
        true
    }

    fn max_image_size(&self) -> u32 {
        (u32::from(self.num_sectors) - 1) * self.sector_size + self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{MockDevice, PRIMARY, SCRATCH, SECONDARY, image_header},
        strategies::tests::perform_swap,
    };

    const SECTOR: usize = 256;

    fn geometry(sectors: u16) -> Geometry {
        Geometry {
            sector_size: SECTOR as u32,
            primary_sectors: sectors,
            secondary_sectors: sectors,
            scratch_sectors: 1,
            trailer_size: 96,
        }
    }

    fn strategy(sectors: u16) -> SwapScratch {
        SwapScratch::new(
            ImageSlots {
                primary: PRIMARY,
                secondary: SECONDARY,
            },
            SCRATCH,
            geometry(sectors),
        )
        .unwrap()
    }

    #[test]
    fn plan_runs_downwards() {
        let strategy = strategy(3);
        assert_eq!(strategy.last_step(), Step(9));

        let first = strategy.plan(Step(0));
        assert_eq!(first.from, MemoryLocation { slot: PRIMARY, sector: Sector(2) });
        assert_eq!(first.to, MemoryLocation { slot: SCRATCH, sector: Sector(0) });
        assert_eq!(first.span, Span::Body);

        let op = strategy.plan(Step(4));
        assert_eq!(op.from, MemoryLocation { slot: SECONDARY, sector: Sector(1) });
        assert_eq!(op.to, MemoryLocation { slot: PRIMARY, sector: Sector(1) });
        assert_eq!(op.span, Span::Sector);

        let last = strategy.plan(Step(8));
        assert_eq!(last.from, MemoryLocation { slot: SCRATCH, sector: Sector(0) });
        assert_eq!(last.to, MemoryLocation { slot: SECONDARY, sector: Sector(0) });

        assert_eq!(strategy.status_slot(Step(0)), SCRATCH);
        assert_eq!(strategy.status_slot(Step(1)), PRIMARY);
        assert_eq!(strategy.max_image_size(), 2 * 256 + 160);
    }

    #[test]
    fn single_scratch() {
        let mut device: MockDevice<SECTOR> = MockDevice::new(&[4, 4, 1]);
        device.program_image(PRIMARY, 0, &image_header(800, 1), 0x11);
        device.program_image(SECONDARY, 0, &image_header(700, 2), 0x22);
        let image_a = device.flash(PRIMARY).to_vec();
        let image_b = device.flash(SECONDARY).to_vec();

        let strategy = strategy(4);
        perform_swap(&mut device, &strategy, strategy.body);

        assert_eq!(device.flash(PRIMARY), &image_b[..]);
        assert_eq!(device.flash(SECONDARY), &image_a[..]);

        assert!(device.check_wear(PRIMARY, 1));
        assert!(device.check_wear(SECONDARY, 1));
        assert!(device.check_wear(SCRATCH, 4));

        // Reversion of swapping is the same operation.
        perform_swap(&mut device, &strategy, strategy.body);

        assert_eq!(device.flash(PRIMARY), &image_a[..]);
        assert_eq!(device.flash(SECONDARY), &image_b[..]);
    }

    #[test]
    fn rejects_unfit_geometry() {
        let slots = ImageSlots {
            primary: PRIMARY,
            secondary: SECONDARY,
        };
        let uneven = Geometry {
            secondary_sectors: 5,
            ..geometry(4)
        };
        assert!(SwapScratch::new(slots, SCRATCH, uneven).is_err());

        let wide_scratch = Geometry {
            scratch_sectors: 2,
            ..geometry(4)
        };
        assert!(SwapScratch::new(slots, SCRATCH, wide_scratch).is_err());

        let huge_trailer = Geometry {
            trailer_size: 256,
            ..geometry(4)
        };
        assert!(SwapScratch::new(slots, SCRATCH, huge_trailer).is_err());
    }
}
