//! Keel apply: the store-facing half of the engine.
//!
//! - [`Converger`] creates or minimally patches one dependent object.
//! - [`assign_owner`] stamps the controlling owner reference used for cascade deletion.
//! - [`StatusPatcher`] writes status only on real difference.
//! - [`Trigger`] flips another resource's `needsReconcile` flag to wake its loop.

#![forbid(unsafe_code)]

mod converge;
mod diff;
mod owner;
mod status;
mod trigger;

pub use converge::Converger;
pub use diff::{owned_patch, owned_view};
pub use owner::{assign_owner, is_controlled_by, owner_reference};
pub use status::StatusPatcher;
pub use trigger::Trigger;
