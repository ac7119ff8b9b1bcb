//! Slot exchange strategies: scratch, move and offset based swapping.
//!
//! Every strategy breaks a swap into numbered steps of exactly one sector copy each.
//! Completion of a step is recorded as a progress marker in a trailer, which is what makes a swap resumable.
//! Strategies share the marker encoding; they differ in which sectors move where and in where the markers live.

use crate::{CopyOperation, Error, ImageSlots, Slot, Step, SwapMode, SwapType};

pub mod swap_move;
pub mod swap_offset;
pub mod swap_scratch;

pub use swap_move::SwapMove;
pub use swap_offset::SwapOffset;
pub use swap_scratch::SwapScratch;

/// A slot exchange strategy.
pub trait Strategy {
    /// The step which denotes that all data has been moved.
    ///
    /// **Warning**: for this specific step and any subsequent step planning a `CopyOperation` is undefined behaviour.
    fn last_step(&self) -> Step;

    /// Plan the copy to be executed for a given step.
    fn plan(&self, step: Step) -> CopyOperation;

    /// Slot whose trailer records the completion of `step`.
    fn status_slot(&self, step: Step) -> Slot;

    /// Whether the last sector of a slot carries both image content and the trailer.
    ///
    /// If not, trailer sectors can be erased without losing image data.
    fn shares_trailer_sector(&self) -> bool {
        false
    }

    /// Byte offset at which the incoming image starts in the secondary slot.
    fn secondary_image_offset(&self) -> u32 {
        0
    }

    /// Largest image, header included, the strategy can move.
    fn max_image_size(&self) -> u32;
}

/// Sizes of an image pair, in sectors of the shared sector size.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Geometry {
    pub sector_size: u32,
    pub primary_sectors: u16,
    pub secondary_sectors: u16,
    /// Zero if the device has no scratch area.
    pub scratch_sectors: u16,
    /// Size of a trailer, progress markers included.
    pub trailer_size: u32,
}

impl Geometry {
    /// Sectors at the end of a slot touched by the trailer.
    pub const fn trailer_sectors(&self) -> u16 {
        self.trailer_size.div_ceil(self.sector_size) as u16
    }
}

/// The strategy selected by the configuration, for one image pair and swap direction.
#[derive(Clone, Debug)]
pub enum SwapStrategy {
    Scratch(SwapScratch),
    Move(SwapMove),
    Offset(SwapOffset),
}

impl SwapStrategy {
    pub fn new(
        mode: SwapMode,
        slots: ImageSlots,
        geometry: Geometry,
        swap_type: SwapType,
    ) -> Result<Self, Error> {
        Ok(match mode {
            SwapMode::Scratch { scratch } => {
                SwapStrategy::Scratch(SwapScratch::new(slots, scratch, geometry)?)
            }
            SwapMode::Move => SwapStrategy::Move(SwapMove::new(slots, geometry)?),
            SwapMode::Offset => {
                SwapStrategy::Offset(SwapOffset::new(slots, geometry, swap_type)?)
            }
        })
    }
}

impl Strategy for SwapStrategy {
    fn last_step(&self) -> Step {
        match self {
            SwapStrategy::Scratch(s) => s.last_step(),
            SwapStrategy::Move(s) => s.last_step(),
            SwapStrategy::Offset(s) => s.last_step(),
        }
    }

    fn plan(&self, step: Step) -> CopyOperation {
        match self {
            SwapStrategy::Scratch(s) => s.plan(step),
            SwapStrategy::Move(s) => s.plan(step),
            SwapStrategy::Offset(s) => s.plan(step),
        }
    }

    fn status_slot(&self, step: Step) -> Slot {
        match self {
            SwapStrategy::Scratch(s) => s.status_slot(step),
            SwapStrategy::Move(s) => s.status_slot(step),
            SwapStrategy::Offset(s) => s.status_slot(step),
        }
    }

    fn shares_trailer_sector(&self) -> bool {
        match self {
            SwapStrategy::Scratch(s) => s.shares_trailer_sector(),
            SwapStrategy::Move(s) => s.shares_trailer_sector(),
            SwapStrategy::Offset(s) => s.shares_trailer_sector(),
        }
    }

    fn secondary_image_offset(&self) -> u32 {
        match self {
            SwapStrategy::Scratch(s) => s.secondary_image_offset(),
            SwapStrategy::Move(s) => s.secondary_image_offset(),
            SwapStrategy::Offset(s) => s.secondary_image_offset(),
        }
    }

    fn max_image_size(&self) -> u32 {
        match self {
            SwapStrategy::Scratch(s) => s.max_image_size(),
            SwapStrategy::Move(s) => s.max_image_size(),
            SwapStrategy::Offset(s) => s.max_image_size(),
        }
    }
}
