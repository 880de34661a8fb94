// SPDX-License-Identifier: MIT

//! Wire protocol of the store service.
//!
//! Connections carry a stream of framed messages in each direction. A
//! message is a block of `Name: Value` headers, a blank line, then a
//! body whose interpretation depends on `Content-Type`:
//!
//! * [frame::CONTENT_TYPE_JSON] — a single JSON-RPC 2.0 message;
//! * [frame::CONTENT_TYPE_EXPORT] — a binary export stream, which is
//!   self-terminating and therefore may omit `Content-Length`.
//!
//! The [methods] module defines the typed parameter and result shapes
//! of the `zb.*` method set.

pub mod frame;
pub mod jsonrpc;
pub mod methods;
