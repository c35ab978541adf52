//! Splitfs client-side library functionality.

mod apistub;

pub use apistub::{ClientApiStub, PutReceipt};
