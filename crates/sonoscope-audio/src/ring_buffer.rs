use rtrb::{Consumer, Producer, RingBuffer};

/// Real-time safe SPSC ring between the audio callback and the
/// processor task. Mono f32 samples.
pub struct SampleRing {
    producer: Producer<f32>,
    consumer: Consumer<f32>,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        let (producer, consumer) = RingBuffer::new(capacity);
        Self { producer, consumer }
    }

    pub fn split(self) -> (SampleProducer, SampleConsumer) {
        (
            SampleProducer {
                producer: self.producer,
            },
            SampleConsumer {
                consumer: self.consumer,
            },
        )
    }
}

/// Callback half. `write` is all-or-nothing: a block that does not fit
/// is dropped whole so the callback never blocks on downstream.
pub struct SampleProducer {
    producer: Producer<f32>,
}

impl SampleProducer {
    pub fn write(&mut self, samples: &[f32]) -> Result<usize, usize> {
        let mut chunk = match self.producer.write_chunk(samples.len()) {
            Ok(chunk) => chunk,
            Err(_) => return Err(samples.len()),
        };

        // Write may wrap; fill both slices
        let (first, second) = chunk.as_mut_slices();
        let split = first.len();
        if split > 0 {
            first.copy_from_slice(&samples[..split]);
        }
        if !second.is_empty() {
            second.copy_from_slice(&samples[split..]);
        }
        chunk.commit_all();
        Ok(samples.len())
    }

    pub fn slots(&self) -> usize {
        self.producer.slots()
    }
}

/// Processor half of the ring.
pub struct SampleConsumer {
    consumer: Consumer<f32>,
}

impl SampleConsumer {
    /// Read up to `buffer.len()` samples, non-blocking.
    pub fn read(&mut self, buffer: &mut [f32]) -> usize {
        let chunk = match self.consumer.read_chunk(buffer.len()) {
            Ok(chunk) => chunk,
            Err(rtrb::chunks::ChunkError::TooFewSlots(available)) => {
                if available == 0 {
                    return 0;
                }
                match self.consumer.read_chunk(available) {
                    Ok(chunk) => chunk,
                    Err(_) => return 0,
                }
            }
        };

        let len = chunk.len();
        let (first, second) = chunk.as_slices();
        let split = first.len();
        if split > 0 {
            buffer[..split].copy_from_slice(first);
        }
        if !second.is_empty() {
            buffer[split..split + second.len()].copy_from_slice(second);
        }
        chunk.commit_all();
        len
    }

    pub fn slots(&self) -> usize {
        self.consumer.slots()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let (mut producer, mut consumer) = SampleRing::new(1024).split();

        let samples = vec![0.1f32, 0.2, 0.3, 0.4, 0.5];
        assert_eq!(producer.write(&samples).unwrap(), 5);

        let mut buffer = vec![0.0f32; 10];
        let read = consumer.read(&mut buffer);

        assert_eq!(read, 5);
        assert_eq!(&buffer[..5], &samples[..]);
    }

    #[test]
    fn full_ring_drops_whole_block() {
        let (mut producer, mut _consumer) = SampleRing::new(16).split();

        assert_eq!(producer.write(&vec![1.0; 20]), Err(20));
        assert!(producer.write(&vec![1.0; 16]).is_ok());
        assert_eq!(producer.write(&[2.0]), Err(1));
    }

    #[test]
    fn partial_read_drains_what_is_there() {
        let (mut producer, mut consumer) = SampleRing::new(64).split();
        producer.write(&vec![0.5; 10]).unwrap();

        let mut buffer = vec![0.0f32; 32];
        assert_eq!(consumer.read(&mut buffer), 10);
        assert_eq!(consumer.read(&mut buffer), 0);
    }
}
