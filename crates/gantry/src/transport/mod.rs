mod kcp;
mod stream;
mod tls;
mod ws;

pub use stream::{RawStream, Stream};
pub(crate) use kcp::{KcpListener, KcpTuning};
pub(crate) use tls::build_server_config;
pub(crate) use ws::WsStream;
