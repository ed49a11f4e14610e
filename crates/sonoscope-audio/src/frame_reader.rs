use crate::ring_buffer::SampleConsumer;

/// Drains mono samples from the capture ring for the processor task.
pub struct BlockReader {
    consumer: SampleConsumer,
    samples_read: u64,
}

impl BlockReader {
    pub fn new(consumer: SampleConsumer) -> Self {
        Self {
            consumer,
            samples_read: 0,
        }
    }

    /// Read up to `max_samples`, non-blocking. `None` when the ring is
    /// empty.
    pub fn read_block(&mut self, max_samples: usize) -> Option<Vec<f32>> {
        let mut buffer = vec![0.0f32; max_samples];
        let read = self.consumer.read(&mut buffer);
        if read == 0 {
            return None;
        }
        buffer.truncate(read);
        self.samples_read += read as u64;
        Some(buffer)
    }

    pub fn available_samples(&self) -> usize {
        self.consumer.slots()
    }

    pub fn total_samples_read(&self) -> u64 {
        self.samples_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring_buffer::SampleRing;

    #[test]
    fn reads_what_the_producer_wrote() {
        let (mut producer, consumer) = SampleRing::new(256).split();
        let mut reader = BlockReader::new(consumer);

        assert!(reader.read_block(64).is_none());

        producer.write(&vec![0.25; 100]).unwrap();
        let block = reader.read_block(64).unwrap();
        assert_eq!(block.len(), 64);
        let rest = reader.read_block(64).unwrap();
        assert_eq!(rest.len(), 36);
        assert_eq!(reader.total_samples_read(), 100);
    }
}
