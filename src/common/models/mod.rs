mod event;
mod ip;
mod passkey;
mod role;
mod user;

pub use event::*;
pub use ip::*;
pub use passkey::*;
pub use role::*;
pub use user::*;
