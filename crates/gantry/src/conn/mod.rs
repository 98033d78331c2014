mod callbacks;
mod connection;
mod manager;

pub use callbacks::CloseCallback;
pub use connection::{ConnHook, Connection};
pub(crate) use connection::ConnContext;
pub use manager::ConnManager;
