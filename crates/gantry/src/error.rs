use std::{io, net::AddrParseError, path::PathBuf};

use gantry_codec::PackError;
use thiserror::Error;

/// Failures of the per-connection send paths.
#[derive(Error, Debug)]
pub enum SendError {
    #[error("connection closed")]
    Closed,
    #[error("send queue full, timed out")]
    Timeout,
    #[error("empty payload")]
    EmptyPayload,
    #[error("pack failed: {0}")]
    Pack(#[from] PackError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnError {
    #[error("no property found")]
    PropertyNotFound,
    #[error("connection not found")]
    NotFound,
}

/// Registration-time errors. Fatal to setup: the embedding application is
/// expected to abort on them.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterError {
    #[error("duplicate handler for msg id {0}")]
    DuplicateMsgId(u32),
    #[error("msg id {id} outside group range {start}..={end}")]
    OutOfGroupRange { id: u32, start: u32, end: u32 },
    #[error("server runs in router-slices mode")]
    SlicesMode,
    #[error("server does not run in router-slices mode")]
    NotSlicesMode,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerError {
    #[error("no free worker available")]
    Exhausted,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config file: {0}")]
    Io(#[from] io::Error),
    #[error("parse config file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("bad listen address: {0}")]
    Addr(#[from] AddrParseError),
    #[error("tls setup failed: {0}")]
    Tls(#[from] rustls::Error),
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
