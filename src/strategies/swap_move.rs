//! Strategy to swap two slots by moving the primary up one sector first.
//!
//! In other bootloaders also called 'swap move'.
//! Instead of a scratch area, the primary slot keeps one spare sector between its image and its trailer.
//! The primary image is first moved up by one sector, starting with the top sector, after which every
//! secondary sector is copied down into the primary and the moved primary sector into the secondary.
//!
//! The trailer sectors at the end of both slots never carry image content, which allows erasing them at will.
//!
//! This results in the primary slot enduring two erasures on most sectors for this strategy, and the secondary slot enduring a single erasure.

use crate::{
    CopyOperation, Error, ImageSlots, MemoryLocation, Sector, Slot, Span, Step,
    strategies::{Geometry, Strategy},
};

#[derive(Clone, Debug)]
pub struct SwapMove {
    /// Sectors carrying image content, excluding the spare sector.
    num_sectors: u16,
    sector_size: u32,
    slot_primary: Slot,
    slot_secondary: Slot,
}

/// Logical phases for the strategy to execute, to decouple raw steps from behaviour in a logical manner.
#[derive(Debug)]
enum Phase {
    /// Move primary sector up by one.
    MoveUp(Sector),
    /// Copy from secondary to primary.
    ToPrimary(Sector),
    /// Copy to secondary from the primary, considering that the primary has been moved up.
    ToSecondary(Sector),
}

impl Phase {
    pub const fn from_step(mut step: Step, num_sectors: u16) -> Phase {
        if step.0 < num_sectors {
            // Top sector first, such that nothing is overwritten before it has moved.
            return Phase::MoveUp(Sector(num_sectors - step.0 - 1));
        }

        step.0 -= num_sectors;

        let sector = Sector(step.0 / 2);
        if step.0 % 2 == 0 {
            Phase::ToPrimary(sector)
        } else {
            Phase::ToSecondary(sector)
        }
    }
}

impl SwapMove {
    pub fn new(slots: ImageSlots, geometry: Geometry) -> Result<Self, Error> {
        if geometry.primary_sectors != geometry.secondary_sectors {
            return Err(Error::BadArgs);
        }

        let num_sectors = geometry
            .primary_sectors
            .checked_sub(geometry.trailer_sectors() + 1)
            .filter(|n| *n > 0)
            .ok_or(Error::BadArgs)?;

        Ok(Self {
            num_sectors,
            sector_size: geometry.sector_size,
            slot_primary: slots.primary,
            slot_secondary: slots.secondary,
        })
    }
}

impl Strategy for SwapMove {
    fn last_step(&self) -> Step {
        // A single move up, and two copies for swap.
        Step(self.num_sectors * 3)
    }

    fn plan(&self, step: Step) -> CopyOperation {
        let phase = Phase::from_step(step, self.num_sectors);

        let primary = |sector| MemoryLocation {
            slot: self.slot_primary,
            sector,
        };
        let secondary = |sector| MemoryLocation {
            slot: self.slot_secondary,
            sector,
        };

        // Convert a logical phase into a raw copy operation.
        let (from, to) = match phase {
            Phase::MoveUp(sector) => (primary(sector), primary(Sector(sector.0 + 1))),
            // To primary slot is copied 1:1, meaning the same sector is copied from secondary.
            Phase::ToPrimary(sector) => (secondary(sector), primary(sector)),
            // To secondary the sector is located one sector up in the primary.
            Phase::ToSecondary(sector) => (primary(Sector(sector.0 + 1)), secondary(sector)),
        };

        CopyOperation {
            from,
            to,
            span: Span::Sector,
        }
    }

    fn status_slot(&self, _step: Step) -> Slot {
        self.slot_primary
    }

    fn max_image_size(&self) -> u32 {
        u32::from(self.num_sectors) * self.sector_size
    }
}
