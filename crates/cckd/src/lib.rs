//! Compressed-CKD (CCKD) DASD image format: on-disk layout, live
//! track read/write, and the offline repair engine (spec §3, §4.2,
//! §4.3).

pub mod compress;
pub mod devtypes;
pub mod error;
pub mod header;
pub mod repair;
pub mod store;
pub mod track;

pub use compress::CompressionKind;
pub use devtypes::{geometry_for, CkdGeometry};
pub use error::{CckdError, Result};
pub use repair::{chkdsk, CheckLevel};
pub use store::CckdImage;
