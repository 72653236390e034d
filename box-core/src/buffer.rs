//! Overwrite-oldest ring of raw analog samples.

use heapless::HistoryBuf;

/// Default samples retained per analog channel.
pub const ANALOG_BUFFER_LEN: usize = 2_048;

/// Power-of-two ring of raw ADC samples.
///
/// Writing into a full buffer drops the oldest sample. A separate counter
/// tracks samples written since the last resetting read.
pub struct AnalogCircularBuffer<const N: usize = ANALOG_BUFFER_LEN> {
    samples: HistoryBuf<u16, N>,
    new_items: usize,
}

impl<const N: usize> AnalogCircularBuffer<N> {
    const POWER_OF_TWO: () = assert!(N.is_power_of_two(), "buffer length must be a power of two");

    #[must_use]
    pub const fn new() -> Self {
        let () = Self::POWER_OF_TWO;
        Self {
            samples: HistoryBuf::new(),
            new_items: 0,
        }
    }

    pub fn write(&mut self, value: u16) {
        self.samples.write(value);
        if self.new_items < N {
            self.new_items += 1;
        }
    }

    /// Copies every slot in chronological order into `out`, zero-padding the
    /// tail when fewer than `N` samples have been written.
    pub fn read_into(&mut self, out: &mut [u16; N], reset: bool) {
        out.fill(0);
        for (slot, sample) in out.iter_mut().zip(self.samples.oldest_ordered()) {
            *slot = *sample;
        }
        if reset {
            self.new_items = 0;
        }
    }

    #[must_use]
    pub fn read(&mut self, reset: bool) -> [u16; N] {
        let mut out = [0; N];
        self.read_into(&mut out, reset);
        out
    }

    #[must_use]
    pub fn latest(&self) -> Option<u16> {
        self.samples.recent().copied()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.samples.is_full()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Samples written since the last resetting read, capped at `N`.
    #[must_use]
    pub const fn new_item_count(&self) -> usize {
        self.new_items
    }
}

impl<const N: usize> Default for AnalogCircularBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrite_keeps_latest_capacity_samples() {
        let mut buffer: AnalogCircularBuffer<8> = AnalogCircularBuffer::new();
        for value in 0..11 {
            buffer.write(value);
        }

        assert!(buffer.is_full());
        assert_eq!(buffer.read(false), [3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(buffer.latest(), Some(10));
        assert_eq!(buffer.new_item_count(), 8);
    }

    #[test]
    fn partial_buffer_reads_zero_padded() {
        let mut buffer: AnalogCircularBuffer<4> = AnalogCircularBuffer::new();
        assert!(buffer.is_empty());
        buffer.write(7);
        buffer.write(9);

        assert_eq!(buffer.read(true), [7, 9, 0, 0]);
        assert_eq!(buffer.new_item_count(), 0);
        assert_eq!(buffer.len(), 2);

        buffer.write(1);
        assert_eq!(buffer.new_item_count(), 1);
    }
}
