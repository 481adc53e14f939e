use crate::config::{Parity, SerialConfiguration};

bitflags::bitflags! {
    /// Line errors a native port reports alongside a received byte.
    pub struct ComErrors: u8 {
        const PARITY = 0x01;
        const FRAMING = 0x02;
        const OVERRUN = 0x04;
        const RX_OVERFLOW = 0x08;
        const BREAK = 0x10;
    }
}

/// The result of one native read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawRead {
    /// The byte read. On a failed read, whatever the port last reported.
    pub value: u8,
    pub errors: ComErrors,
    /// Bytes still waiting in the receive queue after this one.
    pub queued: u32,
    pub success: bool,
}

impl RawRead {
    /// A byte arrived.
    pub const fn received(value: u8, errors: ComErrors, queued: u32) -> Self {
        Self {
            value,
            errors,
            queued,
            success: true,
        }
    }

    /// Nothing arrived within the read timeout.
    pub const fn failed(last_value: u8, errors: ComErrors) -> Self {
        Self {
            value: last_value,
            errors,
            queued: 0,
            success: false,
        }
    }

    pub fn sample(&self) -> RawByteSample {
        RawByteSample {
            value: self.value,
            had_parity_error: self.errors.contains(ComErrors::PARITY),
            queue_depth_after_read: self.queued,
            read_succeeded: self.success,
        }
    }
}

/// The part of a [RawRead] the framing engine looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RawByteSample {
    pub value: u8,
    pub had_parity_error: bool,
    pub queue_depth_after_read: u32,
    pub read_succeeded: bool,
}

/// A platform serial driver that can report and force the parity bit
/// of individual bytes.
///
/// Implementations fold their own I/O failures into the return values:
/// a read that produced nothing has `success` unset, a write that
/// failed accepted zero bytes.
pub trait NativePort {
    /// Open the named port with the given parameters.
    fn open(&mut self, name: &str, config: &SerialConfiguration) -> bool;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Read one byte, waiting at most the configured read timeout.
    fn read(&mut self) -> RawRead;

    /// Write ordinary data with the configured parity. Returns how many
    /// bytes were accepted, which may be fewer than given.
    fn write(&mut self, bytes: &[u8]) -> usize;

    /// Write a single byte with its parity bit forced by `parity`
    /// instead of the configured parity. Returns how many bytes were
    /// accepted.
    fn write_with_parity(&mut self, byte: u8, parity: Parity) -> usize;

    /// Release the underlying OS handle for good.
    fn dispose(&mut self);
}

impl<P> NativePort for &mut P
where
    P: NativePort + ?Sized,
{
    fn open(&mut self, name: &str, config: &SerialConfiguration) -> bool {
        (**self).open(name, config)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn read(&mut self) -> RawRead {
        (**self).read()
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        (**self).write(bytes)
    }

    fn write_with_parity(&mut self, byte: u8, parity: Parity) -> usize {
        (**self).write_with_parity(byte, parity)
    }

    fn dispose(&mut self) {
        (**self).dispose()
    }
}

impl<P> NativePort for Box<P>
where
    P: NativePort + ?Sized,
{
    fn open(&mut self, name: &str, config: &SerialConfiguration) -> bool {
        (**self).open(name, config)
    }

    fn close(&mut self) {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn read(&mut self) -> RawRead {
        (**self).read()
    }

    fn write(&mut self, bytes: &[u8]) -> usize {
        (**self).write(bytes)
    }

    fn write_with_parity(&mut self, byte: u8, parity: Parity) -> usize {
        (**self).write_with_parity(byte, parity)
    }

    fn dispose(&mut self) {
        (**self).dispose()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sample_carries_parity_only() {
        let read = RawRead::received(0x81, ComErrors::PARITY | ComErrors::FRAMING, 3);
        assert_eq!(
            read.sample(),
            RawByteSample {
                value: 0x81,
                had_parity_error: true,
                queue_depth_after_read: 3,
                read_succeeded: true,
            }
        );

        let read = RawRead::received(0x81, ComErrors::OVERRUN, 0);
        assert!(!read.sample().had_parity_error);
    }

    #[test]
    fn failed_read_keeps_last_value() {
        let sample = RawRead::failed(0x42, ComErrors::empty()).sample();
        assert_eq!(sample.value, 0x42);
        assert!(!sample.read_succeeded);
        assert_eq!(sample.queue_depth_after_read, 0);
    }
}
