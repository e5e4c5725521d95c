//! LTX: a binary msgpack protocol for driving test execution without a shell in the loop.

mod client;
mod protocol;
mod sut;

pub use client::{LtxClient, LtxReply, SlotTable};
pub use protocol::{Inbound, ALL_SLOTS, MAX_SLOT};
pub use sut::{LtxConfig, LtxSut};
