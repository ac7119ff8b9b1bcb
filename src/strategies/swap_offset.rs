//! Strategy to swap two slots of different size by toggling the image offset in the secondary slot.
//!
//! In other bootloaders also called 'swap offset'.
//! The secondary slot is one sector larger than the primary slot. An incoming image is staged one sector
//! into the secondary slot; while swapping, every primary sector is saved to the secondary sector below
//! its incoming counterpart, which places the outgoing image at offset zero.
//! Reverting runs the mirror sequence from the top down and restores the image to offset one.
//!
//! Every sector of both slots endures at most a single erasure per swap.

use crate::{
    CopyOperation, Error, ImageSlots, MemoryLocation, Sector, Slot, Span, Step, SwapType,
    strategies::{Geometry, Strategy},
};

/// Location of the incoming image in the secondary slot.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Incoming image at sector one, outgoing image ends at sector zero.
    Upgrade,
    /// Incoming image at sector zero, outgoing image ends at sector one.
    Revert,
}

#[derive(Clone, Debug)]
pub struct SwapOffset {
    /// Sectors of the primary slot carrying image content.
    num_sectors: u16,
    sector_size: u32,
    direction: Direction,
    slot_primary: Slot,
    slot_secondary: Slot,
}

/// Logical phases for the strategy to execute, to decouple raw steps from behaviour in a logical manner.
#[derive(Debug)]
enum Phase {
    /// Save a primary sector into the secondary.
    ToSecondary(Sector),
    /// Copy the incoming sector into the primary.
    ToPrimary(Sector),
}

impl Phase {
    pub const fn from_step(step: Step, num_sectors: u16, direction: Direction) -> Phase {
        let sector = match direction {
            Direction::Upgrade => Sector(step.0 / 2),
            Direction::Revert => Sector(num_sectors - step.0 / 2 - 1),
        };

        if step.0 % 2 == 0 {
            Phase::ToSecondary(sector)
        } else {
            Phase::ToPrimary(sector)
        }
    }
}

impl SwapOffset {
    pub fn new(slots: ImageSlots, geometry: Geometry, swap_type: SwapType) -> Result<Self, Error> {
        if geometry.secondary_sectors != geometry.primary_sectors + 1 {
            return Err(Error::BadArgs);
        }

        let num_sectors = geometry
            .primary_sectors
            .checked_sub(geometry.trailer_sectors())
            .filter(|n| *n > 0)
            .ok_or(Error::BadArgs)?;

        let direction = match swap_type {
            SwapType::Revert => Direction::Revert,
            _ => Direction::Upgrade,
        };

        Ok(Self {
            num_sectors,
            sector_size: geometry.sector_size,
            direction,
            slot_primary: slots.primary,
            slot_secondary: slots.secondary,
        })
    }

    pub const fn direction(&self) -> Direction {
        self.direction
    }
}

impl Strategy for SwapOffset {
    fn last_step(&self) -> Step {
        Step(self.num_sectors * 2)
    }

    fn plan(&self, step: Step) -> CopyOperation {
        let phase = Phase::from_step(step, self.num_sectors, self.direction);

        let primary = |sector| MemoryLocation {
            slot: self.slot_primary,
            sector,
        };
        let secondary = |sector: Sector| MemoryLocation {
            slot: self.slot_secondary,
            sector,
        };
        let up = |sector: Sector| Sector(sector.0 + 1);

        let (from, to) = match (self.direction, phase) {
            (Direction::Upgrade, Phase::ToSecondary(sector)) => (primary(sector), secondary(sector)),
            (Direction::Upgrade, Phase::ToPrimary(sector)) => (secondary(up(sector)), primary(sector)),
            (Direction::Revert, Phase::ToSecondary(sector)) => (primary(sector), secondary(up(sector))),
            (Direction::Revert, Phase::ToPrimary(sector)) => (secondary(sector), primary(sector)),
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

    fn secondary_image_offset(&self) -> u32 {
        match self.direction {
            Direction::Upgrade => self.sector_size,
            Direction::Revert => 0,
        }
    }

    fn max_image_size(&self) -> u32 {
        u32::from(self.num_sectors) * self.sector_size
    }
}
