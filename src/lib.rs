// Copyright 2020 Joyent, Inc.

//! Fast: A simple RPC protcol used by Joyent products
//!
//! Fast is a simple RPC protocol used in
//! Joyent's[Triton](http://github.com/joyent/triton) and
//! [Manta](https://github.com/joyent/manta) systems, particularly in the
//! [Moray](https://github.com/joyent/moray) and
//! [Boray](https://github.com/joyent/boray) components.
//!
//! This crate provides a Fast client that multiplexes any number of
//! concurrent RPCs over one connection. Responses are routed back to their
//! requests by message id, in whatever order the server sends them.
//!
//! ```no_run
//! use fast_rpc::{FastClient, RpcOptions};
//! use serde_json::json;
//! use tokio::net::TcpStream;
//!
//! # async fn call() -> Result<(), Box<dyn std::error::Error>> {
//! let stream = TcpStream::connect("127.0.0.1:2030").await?;
//! let client = FastClient::new(stream, None);
//! let result = client
//!     .rpc("echo", vec![json!("hello")], RpcOptions::new())
//!     .result()
//!     .await;
//! if let Some(err) = result.error {
//!     return Err(err.into());
//! }
//! println!("{:?}", result.data);
//! # Ok(())
//! # }
//! ```
//!
//! Protocol definition
//!
//! Fast protocol messages have the following structure:
//!
//! <img src="../../../docs/fastpacket.svg" width="100%" height="100%">
//!
//! * VERSION   1-byte integer.  The only supported value is "1".
//!
//! * TYPE      1-byte integer.  The only supported value is TYPE_JSON (0x1),
//!           indicating that the data payload is an encoded JSON object.
//!
//! * STATUS    1-byte integer.  The only supported values are:
//!
//!     * STATUS_DATA  0x1  indicates a "data" message
//!
//!     * STATUS_END   0x2  indicates an "end" message
//!
//!     * STATUS_ERROR 0x3  indicates an "error" message
//!
//! * MSGID1...MSGID4    4-byte big-endian unsigned integer, a unique identifier
//!                    for this message
//!
//! * CRC1...CRC4        4-byte big-endian unsigned integer representing the CRC16
//!                     value of the data payload
//!
//! * DLEN0...DLEN4      4-byte big-endian unsigned integer representing the number
//!                    of bytes of data payload that follow
//!
//! * DATA0...DATAN      Data payload.  This is a JSON-encoded object (for TYPE =
//!                    TYPE_JSON).  The encoding length in bytes is given by the
//!                    DLEN0...DLEN4 bytes.
//!
//! The payload object has a `d` field. For "data" and "end" messages it is
//! an array of response values; for "error" messages it is an object with at
//! least `name` and `message` string fields. Requests also carry an `m`
//! field naming the RPC method.
//!
//! Message IDs: each Fast message has a message id, which is scoped to the Fast
//! connection.  These are allocated sequentially from a circular 31-bit space.

#![allow(missing_docs)]

pub mod client;
pub mod error;
pub mod protocol;
pub mod request;

pub use client::{FastClient, FastClientConfig};
pub use error::{FastError, FastErrorKind, ProtocolReason};
pub use request::{FastRequest, RequestState, RpcOptions, RpcResult};
