// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Newline-delimited JSON-RPC 2.0 server: decodes request lines, dispatches
//! them against a running [`opal_supervisor::Supervisor`], and forwards every
//! bus event as an `agent/event` notification.

mod debug;
mod pending;
mod protocol;
mod relay;
mod server;
mod transport;

pub use debug::{BoundedRing, Direction, RpcLogEntry};
pub use pending::PendingRequests;
pub use protocol::{
    ErrorObject, IncomingMessage, OutgoingNotification, OutgoingRequest, RequestId, Response,
    INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST, METHOD_NOT_FOUND, PARSE_ERROR,
};
pub use relay::{RpcApprovalHandler, RpcQuestionHandler, CLIENT_REQUEST_TIMEOUT};
pub use server::Server;
pub use transport::{send, MessageWriter, StdoutWriter};
