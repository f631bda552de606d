//! Jensen protocol: constants, outer frame codec, file-catalog parsing,
//! and the device clock codec.

pub mod constants;
pub mod frame;
pub mod listing;
pub mod time;

pub use frame::{CommandFrame, FrameDecoder, FrameError, ResponseFrame};
pub use listing::{FileEntry, FileListing, listing_appears_complete, parse_file_list};
pub use time::{DeviceTime, TimeError};
