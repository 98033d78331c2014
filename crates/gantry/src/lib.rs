mod config;
mod conn;
mod decoder;
mod dispatch;
mod error;
mod heartbeat;
mod interceptor;
mod request;
mod router;
mod server;
mod transport;

pub use gantry_codec as codec;
pub use gantry_utils as utils;
pub use tracing;

pub use config::{
    CONFIG_FILE_PATH_ENV, DEFAULT_CONFIG_FILE, ServerConfig, ServerMode, WorkerMode,
};
pub use conn::{CloseCallback, ConnHook, ConnManager, Connection};
pub use decoder::{Decoder, HtlvCrcDecoder, HtlvCrcFrame, TlvDecoder, TlvFrame};
pub use dispatch::MsgHandler;
pub use error::{
    ConfigError, ConnError, RouterError, SendError, ServerError, WorkerError,
};
pub use heartbeat::{
    HEARTBEAT_DEFAULT_MSG_ID, HeartBeatOption, HeartbeatChecker, HeartbeatFn, HeartbeatMsgFn,
    OnRemoteNotAlive,
};
pub use interceptor::{Chain, ChainBuilder, IcResp, Interceptor};
pub use request::{HandleStep, PropertyValue, Request, RouterHandler};
pub use router::{GroupRouter, Router, RouterSlices};
pub use server::{Server, WebsocketAuth, WsUpgradeRequest};
pub use transport::{RawStream, Stream};
