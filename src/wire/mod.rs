//! RFC 6455 wire codec: frame encode/decode and the upgrade handshake.
//!
//! The framing here is deliberately hand-rolled; the gateway protocol is
//! sensitive to exact masking and length-encoding behavior, and both the
//! client and the mock server in the test suite share this one codec.

mod frame;
mod handshake;

pub use frame::{decode_frame, encode_frame, DecodedFrame, OP_BINARY, OP_CLOSE, OP_PING, OP_PONG, OP_TEXT};
pub use handshake::{
    accept_for_key, client_request, generate_key, parse_http_head, server_response, WS_GUID,
};
