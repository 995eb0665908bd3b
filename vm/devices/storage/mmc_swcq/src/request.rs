// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Storage requests accepted by the scheduler.

use crate::transport::CommandError;
use thiserror::Error;

/// Data direction of a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Per-request attributes forwarded to the device.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct RequestFlags {
    /// Use a reliable write. Ignored for reads.
    pub reliable_write: bool,
    /// The data is tagged as frequently accessed system data.
    pub data_tag: bool,
    /// Queue the task with high priority.
    pub realtime: bool,
}

type Continuation = Box<dyn FnOnce(Result<(), RequestError>) + Send>;

/// A block-layer request, already translated into a starting block and a
/// block count.
///
/// The continuation is invoked exactly once, when the request completes or
/// is failed.
pub struct Request {
    pub(crate) tag: u8,
    pub(crate) direction: Direction,
    pub(crate) lba: u32,
    pub(crate) block_count: u16,
    pub(crate) flags: RequestFlags,
    pub(crate) attempts: u32,
    done: Option<Continuation>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("tag", &self.tag)
            .field("direction", &self.direction)
            .field("lba", &self.lba)
            .field("block_count", &self.block_count)
            .field("flags", &self.flags)
            .field("attempts", &self.attempts)
            .finish()
    }
}

impl Request {
    /// Creates a new request. `tag` must be unique among the requests
    /// outstanding on the queue.
    pub fn new(
        tag: u8,
        direction: Direction,
        lba: u32,
        block_count: u16,
        done: impl FnOnce(Result<(), RequestError>) + Send + 'static,
    ) -> Self {
        Self {
            tag,
            direction,
            lba,
            block_count,
            flags: RequestFlags::default(),
            attempts: 0,
            done: Some(Box::new(done)),
        }
    }

    pub fn with_flags(mut self, flags: RequestFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn tag(&self) -> u8 {
        self.tag
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn lba(&self) -> u32 {
        self.lba
    }

    pub fn block_count(&self) -> u16 {
        self.block_count
    }

    pub fn flags(&self) -> RequestFlags {
        self.flags
    }

    pub(crate) fn is_tracked_read(&self, blocks: u16) -> bool {
        self.direction == Direction::Read && self.block_count == blocks
    }

    pub(crate) fn complete(mut self, result: Result<(), RequestError>) {
        if let Some(done) = self.done.take() {
            done(result);
        }
    }
}

/// The reason a request failed.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("transfer failed after {attempts} attempts")]
    Transfer {
        attempts: u32,
        #[source]
        source: CommandError,
    },
    #[error("write rejected by write protection")]
    WriteProtected,
    #[error("queue was shut down")]
    Shutdown,
}
