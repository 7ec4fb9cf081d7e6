//! quartet: typed clients and servers for the four canonical RPC interaction
//! patterns over one multiplexed connection.
//!
//! Each service here demonstrates one shape of call: unary (Sum, SquareRoot,
//! Greet, the record CRUD), server-streaming (PrimeNumber, GreetManyTimes,
//! ListRecords), client-streaming (Average, LongGreet) and duplex (FindMax,
//! GreetAll). The wire protocol and the session underneath live in
//! `quartet-core`; this crate turns raw channels into typed call handles and
//! routes incoming requests to service implementations.

pub mod calculator;
pub mod call;
pub mod context;
pub mod greet;
pub mod pacing;
pub mod records;
pub mod router;
pub mod store;

pub use quartet_core as core;

pub use call::{
    ClientStreamingCall, Completion, DuplexCall, DuplexReceiver, DuplexSender, Inbound, Outbound,
    Streaming,
};
pub use context::CallContext;
pub use pacing::Pacing;
pub use router::{Router, ServiceDispatch};
pub use store::{MemStore, Record, RecordFields, RecordStore, StoreError};
