//! Rewrite passes, one per pipeline stage.

mod async_dealloc;
mod canonicalize;
mod dead_code;
mod layout_rewrite;
mod loop_trip_count;

pub use async_dealloc::AsyncDeallocPass;
pub use canonicalize::RnnLayoutPass;
pub use dead_code::{DeadCodePass, sweep_dead_ops};
pub use layout_rewrite::LayoutRewritePass;
pub use loop_trip_count::LoopTripCountPass;
