//! Local rewrite patterns.

mod async_dealloc;
mod chain;
mod conversion;
mod convert_fold;
mod rnn_layout;
mod trip_count;

pub use async_dealloc::AsyncRegionDealloc;
pub use chain::UnstickLoadStoreStickRemoval;
pub use conversion::{DeadConversionRemoval, StickViewUnstickRemoval, UnstickStickRemoval};
pub use convert_fold::ConvertFold;
pub use rnn_layout::RnnLayoutCanonicalization;
pub use trip_count::LoopTripCountNarrowing;
