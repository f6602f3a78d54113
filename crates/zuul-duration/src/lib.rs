//! Duration parsing, serde codecs, and the window growth/decay arithmetic
//! shared by the dependent and serial pipeline managers (spec §5).

pub mod codec;
pub mod window;

pub use window::{WindowGrowthType, WindowPolicy};
