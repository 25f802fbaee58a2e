use crate::error::Result;

/// A raw, possibly lossy, byte-oriented link to the radio (or whatever stands
/// in for it).
///
/// Implementations must never block forever in [`read`](ByteChannel::read):
/// a read that times out returns whatever arrived, possibly nothing.
pub trait ByteChannel: Send {
    /// Open the link.
    fn connect(&mut self) -> Result<()>;

    /// Close the link. Closing an already closed channel is not an error.
    fn disconnect(&mut self) -> Result<()>;

    /// Tear down and re-open the link.
    fn reconnect(&mut self) -> Result<()> {
        self.disconnect()?;
        self.connect()
    }

    /// Read up to `max` bytes. Returns short (or empty) on timeout.
    fn read(&mut self, max: usize) -> Result<Vec<u8>>;

    /// Write `data`, returning how many bytes were accepted.
    fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Whether the link is currently open.
    fn is_connected(&self) -> bool;

    /// Whether [`reconnect`](ByteChannel::reconnect) can succeed at all.
    fn can_reconnect(&self) -> bool {
        true
    }

    /// Whether arbitrary bytes survive the link. Channels that are not 8-bit
    /// clean get base64-armored frames.
    fn is_eight_bit_clean(&self) -> bool {
        true
    }

    /// Channel name for diagnostics.
    fn name(&self) -> &str;

    /// Write all of `data`, retrying short writes.
    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut offset = 0usize;
        while offset < data.len() {
            match self.write(&data[offset..])? {
                0 => {
                    return Err(crate::ChannelError::Io(std::io::Error::from(
                        std::io::ErrorKind::WriteZero,
                    )))
                }
                n => offset += n,
            }
        }
        Ok(())
    }
}

impl<C: ByteChannel + ?Sized> ByteChannel for Box<C> {
    fn connect(&mut self) -> Result<()> {
        (**self).connect()
    }

    fn disconnect(&mut self) -> Result<()> {
        (**self).disconnect()
    }

    fn reconnect(&mut self) -> Result<()> {
        (**self).reconnect()
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>> {
        (**self).read(max)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        (**self).write(data)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn can_reconnect(&self) -> bool {
        (**self).can_reconnect()
    }

    fn is_eight_bit_clean(&self) -> bool {
        (**self).is_eight_bit_clean()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
