use std::collections::HashMap;

use regsteer_proto::{
    ArrayOrdering, DataSlice, Handle, IoDataMsg, IoTypeEntry, Labeled, Message, ProtoError,
};
use tracing::{debug, info};

use super::AppSession;
use crate::error::{Result, SteerError};
use crate::link::Link;

/// Data link of one I/O type and the transfer open on it.
pub(super) struct IoChannel {
    link: Link,
    transfer: Transfer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transfer {
    Idle,
    Emitting { seq_num: i64 },
    Consuming { cursor: usize },
}

impl AppSession {
    /// Carry the data of I/O type `handle` over `link`, replacing any
    /// earlier link. Whatever transfer was open on the old link is dropped.
    pub fn connect_io(&mut self, handle: Handle, link: Link) -> Result<()> {
        let io = self.io_types.get_mut(handle)?;
        io.buffer_mut().clear();
        info!(label = io.label(), peer = link.peer(), "data channel connected");
        self.io_channels.insert(
            handle,
            IoChannel {
                link,
                transfer: Transfer::Idle,
            },
        );
        Ok(())
    }

    /// Drop the data link of `handle`, returning it if there was one.
    pub fn disconnect_io(&mut self, handle: Handle) -> Option<Link> {
        if let Ok(io) = self.io_types.get_mut(handle) {
            io.buffer_mut().clear();
        }
        self.io_channels.remove(&handle).map(|channel| channel.link)
    }

    /// Open an emission of sample `seq_num` on an outgoing I/O type.
    pub fn emit_start(&mut self, handle: Handle, seq_num: i64) -> Result<()> {
        let io = self.io_types.get_mut(handle)?;
        if !io.direction().emits() {
            return Err(invalid(format!("'{}' does not emit data", io.label())));
        }
        if !io.is_enabled() {
            return Err(invalid(format!("'{}' is disabled", io.label())));
        }
        let channel = idle_channel(&mut self.io_channels, handle, io)?;
        io.buffer_mut().clear();
        channel.transfer = Transfer::Emitting { seq_num };
        Ok(())
    }

    /// Add one slice to the open emission.
    ///
    /// With a column-major layout set, a numeric slice holding one whole
    /// block is sent in row-major order.
    pub fn emit_data_slice(&mut self, handle: Handle, slice: DataSlice) -> Result<()> {
        let io = self.io_types.get_mut(handle)?;
        match self.io_channels.get(&handle).map(|c| c.transfer) {
            Some(Transfer::Emitting { .. }) => {}
            _ => return Err(invalid(format!("no emission open on '{}'", io.label()))),
        }
        let slice = match io.layout() {
            Some(layout) if layout.ordering == ArrayOrdering::ColumnMajor => {
                slice.reordered(layout)?
            }
            _ => slice,
        };
        slice.write_to(io.buffer_mut())?;
        Ok(())
    }

    /// Send the buffered slices as one block and close the emission.
    /// Returns the number of data bytes sent.
    pub fn emit_stop(&mut self, handle: Handle) -> Result<usize> {
        let io = self.io_types.get_mut(handle)?;
        let Some(channel) = self.io_channels.get_mut(&handle) else {
            return Err(no_channel(io));
        };
        let Transfer::Emitting { seq_num } = channel.transfer else {
            return Err(invalid(format!("no emission open on '{}'", io.label())));
        };
        channel.transfer = Transfer::Idle;

        let block = IoDataMsg {
            handle,
            seq_num,
            data: io.buffer().as_slice().to_vec(),
        };
        let bytes = block.data.len();
        io.buffer_mut().clear();
        channel.link.send(&Message::IoData(block))?;
        debug!(label = io.label(), seq_num, bytes, "emitted data");
        Ok(bytes)
    }

    /// Take the next block waiting on an incoming I/O type, without
    /// blocking. Returns its sequence number, or `None` when nothing has
    /// arrived.
    pub fn consume_start(&mut self, handle: Handle) -> Result<Option<i64>> {
        let io = self.io_types.get_mut(handle)?;
        if !io.direction().consumes() {
            return Err(invalid(format!("'{}' does not consume data", io.label())));
        }
        let channel = idle_channel(&mut self.io_channels, handle, io)?;
        let block = match channel.link.try_recv()? {
            None => return Ok(None),
            Some(Message::IoData(block)) => block,
            Some(other) => {
                return Err(ProtoError::UnexpectedKind(other.kind().to_string()).into());
            }
        };

        io.buffer_mut().clear();
        io.buffer_mut().extend(&block.data)?;
        channel.transfer = Transfer::Consuming { cursor: 0 };
        debug!(
            label = io.label(),
            seq_num = block.seq_num,
            bytes = block.data.len(),
            "consuming data"
        );
        Ok(Some(block.seq_num))
    }

    /// Next slice of the block being consumed, or `None` once all are read.
    ///
    /// With a column-major layout set, a numeric slice holding one whole
    /// block is handed back in column-major order.
    pub fn consume_data_slice(&mut self, handle: Handle) -> Result<Option<DataSlice>> {
        let io = self.io_types.get(handle)?;
        let channel = self.io_channels.get_mut(&handle);
        let (channel, cursor) = match channel {
            Some(channel) => match channel.transfer {
                Transfer::Consuming { cursor } => (channel, cursor),
                _ => return Err(invalid(format!("nothing being consumed on '{}'", io.label()))),
            },
            None => return Err(no_channel(io)),
        };

        let data = io.buffer().as_slice();
        if cursor >= data.len() {
            return Ok(None);
        }
        let (slice, used) = DataSlice::read_from(&data[cursor..])?;
        channel.transfer = Transfer::Consuming {
            cursor: cursor + used,
        };
        let slice = match io.layout() {
            Some(layout) if layout.ordering == ArrayOrdering::ColumnMajor => {
                slice.reordered(&layout.reordered())?
            }
            _ => slice,
        };
        Ok(Some(slice))
    }

    /// Close the block being consumed, discarding unread slices.
    pub fn consume_stop(&mut self, handle: Handle) -> Result<()> {
        let io = self.io_types.get_mut(handle)?;
        let Some(channel) = self.io_channels.get_mut(&handle) else {
            return Err(no_channel(io));
        };
        if !matches!(channel.transfer, Transfer::Consuming { .. }) {
            return Err(invalid(format!("nothing being consumed on '{}'", io.label())));
        }
        channel.transfer = Transfer::Idle;
        io.buffer_mut().clear();
        Ok(())
    }
}

fn idle_channel<'a>(
    channels: &'a mut HashMap<Handle, IoChannel>,
    handle: Handle,
    io: &IoTypeEntry,
) -> Result<&'a mut IoChannel> {
    let channel = channels.get_mut(&handle).ok_or_else(|| no_channel(io))?;
    if channel.transfer != Transfer::Idle {
        return Err(invalid(format!("a transfer is already open on '{}'", io.label())));
    }
    Ok(channel)
}

fn no_channel(io: &IoTypeEntry) -> SteerError {
    invalid(format!("no data channel for '{}'", io.label()))
}

fn invalid(reason: String) -> SteerError {
    ProtoError::InvalidArgument(reason).into()
}
