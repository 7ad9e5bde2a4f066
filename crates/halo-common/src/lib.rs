pub mod errors;
pub mod id;

pub use errors::{PresenceError, StoreError};
pub use id::{new_id, ChannelId};

pub type Result<T> = std::result::Result<T, PresenceError>;
