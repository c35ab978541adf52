//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod error;
mod safetcp;

pub use config::config_text;
pub use error::SplitfsError;
pub use print::{logger_init, me_prefix, set_me, ME};

pub(crate) use safetcp::{
    tcp_bind_with_retry, tcp_connect_with_retry, FramedConn,
};
