//! Swap decision: a pure function from the trailers of an image pair to the action for this boot.
//!
//! Inconsistent metadata is ruled out first, as it may make every other field untrustworthy.
//! The remaining cases are resolved by a table of patterns, evaluated in order, of which the first match wins.
//! No match means the trailers describe a state no writer produces, which resolves to [`SwapType::Panic`].
//!
//! A staged request in the secondary trailer always outranks what the primary trailer records:
//! completing a swap erases the secondary trailer before committing the primary, so a `copy_done` seen next
//! to a staged request stems from the previous cycle.
//!
//! Whether earlier boots confirmed the running image is read from the primary `image_ok` flag, the only
//! place confirmation is persisted.
//!
//! [`SwapType::Fail`] is never produced here; it results from the image validator rejecting the image
//! chosen by this decision.

use defmt_or_log::{debug, warn};

use crate::trailer::{Flag, Magic, SwapInfo, SwapState, SwapType};

/// Magic condition of a pattern. `Any` and `NotGood` only exist for matching, they are never stored.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MagicMatch {
    Good,
    Bad,
    Unset,
    Any,
    NotGood,
}

impl MagicMatch {
    pub const fn matches(self, magic: Magic) -> bool {
        match self {
            MagicMatch::Good => matches!(magic, Magic::Good),
            MagicMatch::Bad => matches!(magic, Magic::Bad),
            MagicMatch::Unset => matches!(magic, Magic::Unset),
            MagicMatch::Any => true,
            MagicMatch::NotGood => !matches!(magic, Magic::Good),
        }
    }
}

/// Flag condition of a pattern. `Any` only exists for matching.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FlagMatch {
    Set,
    Bad,
    Unset,
    Any,
}

impl FlagMatch {
    pub const fn matches(self, flag: Flag) -> bool {
        match self {
            FlagMatch::Set => matches!(flag, Flag::Set),
            FlagMatch::Bad => matches!(flag, Flag::Bad),
            FlagMatch::Unset => matches!(flag, Flag::Unset),
            FlagMatch::Any => true,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum SwapMatch {
    Any,
    /// No swap recorded: either no valid trailer, or one without swap info.
    Absent,
    Test,
    /// Test, permanent or revert.
    Swap,
}

impl SwapMatch {
    fn matches(self, state: &SwapState) -> bool {
        match self {
            SwapMatch::Any => true,
            SwapMatch::Absent => state.magic != Magic::Good || state.swap_info == SwapInfo::Unset,
            SwapMatch::Test => matches!(state.swap_info, SwapInfo::Test { .. }),
            SwapMatch::Swap => state.swap_info.swap_type().is_swap(),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Pattern {
    magic: MagicMatch,
    swap: SwapMatch,
    copy_done: FlagMatch,
    image_ok: FlagMatch,
}

impl Pattern {
    const ANY: Pattern = Pattern {
        magic: MagicMatch::Any,
        swap: SwapMatch::Any,
        copy_done: FlagMatch::Any,
        image_ok: FlagMatch::Any,
    };

    fn matches(&self, state: &SwapState) -> bool {
        self.magic.matches(state.magic)
            && self.swap.matches(state)
            && self.copy_done.matches(state.copy_done)
            && self.image_ok.matches(state.image_ok)
    }
}

#[derive(Clone, Copy, Debug)]
enum Action {
    Fixed(SwapType),
    /// Whatever the secondary trailer requests.
    Requested,
}

#[derive(Clone, Copy, Debug)]
struct Rule {
    primary: Pattern,
    secondary: Pattern,
    action: Action,
}

const RULES: [Rule; 5] = [
    // Nothing staged and nothing recorded.
    Rule {
        primary: Pattern {
            swap: SwapMatch::Absent,
            ..Pattern::ANY
        },
        secondary: Pattern {
            swap: SwapMatch::Absent,
            ..Pattern::ANY
        },
        action: Action::Fixed(SwapType::None),
    },
    // A staged request that has not completed.
    Rule {
        primary: Pattern::ANY,
        secondary: Pattern {
            magic: MagicMatch::Good,
            swap: SwapMatch::Swap,
            ..Pattern::ANY
        },
        action: Action::Requested,
    },
    // Test boot that was never confirmed.
    Rule {
        primary: Pattern {
            magic: MagicMatch::Good,
            swap: SwapMatch::Test,
            image_ok: FlagMatch::Unset,
            ..Pattern::ANY
        },
        secondary: Pattern::ANY,
        action: Action::Fixed(SwapType::Revert),
    },
    Rule {
        primary: Pattern {
            magic: MagicMatch::Good,
            swap: SwapMatch::Test,
            image_ok: FlagMatch::Bad,
            ..Pattern::ANY
        },
        secondary: Pattern::ANY,
        action: Action::Fixed(SwapType::Revert),
    },
    // Swapped and confirmed.
    Rule {
        primary: Pattern {
            magic: MagicMatch::Good,
            swap: SwapMatch::Swap,
            copy_done: FlagMatch::Set,
            image_ok: FlagMatch::Set,
        },
        secondary: Pattern::ANY,
        action: Action::Fixed(SwapType::None),
    },
];

/// Whether a trailer holds a combination none of the writers can produce.
fn inconsistent(image: u8, state: &SwapState, primary: bool) -> bool {
    match state.magic {
        Magic::Good => match state.swap_info {
            SwapInfo::Invalid(_) => true,
            info if info.image().is_some_and(|n| n != image) => true,
            _ => state.copy_done == Flag::Bad,
        },
        Magic::Bad => primary && state.copy_done == Flag::Set,
        Magic::Unset => false,
    }
}

/// Decide on the action for image pair `image`, given its trailers. `None` means no trailer is present.
pub fn decide(image: u8, primary: Option<&SwapState>, secondary: Option<&SwapState>) -> SwapType {
    let primary = primary.copied().unwrap_or(SwapState::UNSET);
    let secondary = secondary.copied().unwrap_or(SwapState::UNSET);

    if inconsistent(image, &primary, true) || inconsistent(image, &secondary, false) {
        warn!(
            "Inconsistent trailers for image {}: primary {:?}, secondary {:?}",
            image, primary, secondary
        );
        return SwapType::Panic;
    }

    let swap_type = RULES
        .iter()
        .find(|rule| rule.primary.matches(&primary) && rule.secondary.matches(&secondary))
        .map(|rule| match rule.action {
            Action::Fixed(swap_type) => swap_type,
            Action::Requested => secondary.swap_info.swap_type(),
        })
        .unwrap_or(SwapType::Panic);

    debug!("Image {}: decided on {:?}", image, swap_type);
    swap_type
}
