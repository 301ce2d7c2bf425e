// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A library for the vfio-user device passthrough protocol and the host VFIO
//! resources it is served from.
//!
//! The protocol side speaks a simple request/reply framing over a UNIX domain
//! socket: a client ([`DeviceClient`]) issues device queries and a server
//! ([`DeviceServer`]) routes them to a [`Device`] implementation. File
//! descriptors travel as `SCM_RIGHTS` ancillary data attached to message
//! headers.
//!
//! The host side ([`VfioContainer`], [`VfioGroup`], [`VfioDevice`]) wraps the
//! kernel's `/dev/vfio` interface: container and group lifecycle, DMA
//! mapping through the IOMMU, SPAPR TCE windows and EEH error handling.

mod sock_ctrl_msg;

pub mod connection;
pub mod container;
pub mod device;
pub mod device_client;
pub mod device_server;
pub mod message;

#[cfg(test)]
mod test_device;

use std::io::Error as IOError;
use std::num::TryFromIntError;

use remain::sorted;
use thiserror::Error as ThisError;

pub use crate::connection::Connection;
pub use crate::connection::SocketListener;
pub use crate::container::IommuMapper;
pub use crate::container::VfioContainer;
pub use crate::container::VfioDevice;
pub use crate::container::VfioError;
pub use crate::container::VfioGroup;
pub use crate::device::Device;
pub use crate::device::HandlerResult;
pub use crate::device_client::DeviceClient;
pub use crate::device_server::DeviceServer;

/// Errors for socket operations and protocol handling.
#[sorted]
#[derive(Debug, ThisError)]
pub enum Error {
    /// Client exited properly.
    #[error("client exited properly")]
    ClientExit,
    /// The connection was retired by an earlier protocol violation.
    #[error("connection is broken and no longer accepts messages")]
    ConnectionBroken,
    /// The peer disconnected.
    #[error("peer closed the connection")]
    Disconnect,
    /// Wrong number of attached file descriptors.
    #[error("wrong number of attached fds")]
    IncorrectFds,
    /// Failure converting a message size.
    #[error("invalid cast to int: {0}")]
    InvalidCastToInt(TryFromIntError),
    /// A message was malformed: bad flags, mis-sized body or an out of
    /// contract reply.
    #[error("invalid message")]
    InvalidMessage,
    /// A message advertised a payload larger than the protocol allows.
    #[error("oversized message")]
    OversizedMsg,
    /// Only part of a message could be transferred.
    #[error("partial message")]
    PartialMessage,
    /// The device failed to handle a request; carries the OS error it
    /// reported.
    #[error("device failed to handle request: {0}")]
    ReqHandlerError(#[source] IOError),
    /// Failure while connecting to the peer.
    #[error("failed to connect to peer: {0}")]
    SocketConnect(#[source] IOError),
    /// Generic socket failure.
    #[error("socket error: {0}")]
    SocketError(IOError),
    /// A socket operation needs to be retried.
    #[error("temporary socket error: {0}")]
    SocketRetry(#[source] IOError),
    /// The peer sent a request code this implementation does not define.
    #[error("unknown request code {0}")]
    UnknownRequest(u32),
}

/// Result of socket operations and protocol handling.
pub type Result<T> = std::result::Result<T, Error>;
