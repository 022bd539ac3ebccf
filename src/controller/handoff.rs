//! Latest-frame handoff between a capture thread and its consumer
//!
//! Holds at most one frame. A new frame replaces one the consumer has not
//! taken yet, so a slow consumer always sees the freshest audio and the
//! producer never blocks. Frames move whole, never torn.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("no frame within the deadline")]
    MissedDeadline,

    #[error("producer is gone")]
    Disconnected,
}

pub fn handoff() -> (FrameProducer, FrameConsumer) {
    let (tx, rx) = bounded::<Vec<f32>>(1);
    (
        FrameProducer {
            tx,
            evict: rx.clone(),
        },
        FrameConsumer { rx },
    )
}

pub struct FrameProducer {
    tx: Sender<Vec<f32>>,
    evict: Receiver<Vec<f32>>,
}

impl FrameProducer {
    /// Publish a frame, replacing any unconsumed one; false once the consumer is gone
    pub fn publish(&self, frame: Vec<f32>) -> bool {
        let mut frame = frame;
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    // stale frame: drop it and retry
                    let _ = self.evict.try_recv();
                    frame = back;
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }
}

pub struct FrameConsumer {
    rx: Receiver<Vec<f32>>,
}

impl FrameConsumer {
    /// Wait up to `timeout` for the next frame
    pub fn fetch(&self, timeout: Duration) -> Result<Vec<f32>, HandoffError> {
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => Ok(frame),
            Err(RecvTimeoutError::Timeout) => Err(HandoffError::MissedDeadline),
            Err(RecvTimeoutError::Disconnected) => Err(HandoffError::Disconnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_frame_wins() {
        let (producer, consumer) = handoff();
        assert!(producer.publish(vec![1.0; 4]));
        assert!(producer.publish(vec![2.0; 4]));
        assert_eq!(consumer.fetch(Duration::from_millis(10)).unwrap(), vec![2.0; 4]);
        assert_eq!(
            consumer.fetch(Duration::from_millis(10)),
            Err(HandoffError::MissedDeadline)
        );
    }

    #[test]
    fn test_disconnect_both_ways() {
        let (producer, consumer) = handoff();
        drop(producer);
        assert_eq!(
            consumer.fetch(Duration::from_millis(10)),
            Err(HandoffError::Disconnected)
        );

        let (producer, consumer) = handoff();
        drop(consumer);
        assert!(!producer.publish(vec![0.0]));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::thread;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn frames_arrive_whole_and_in_order(frames in 1usize..200, len in 1usize..64) {
            let (producer, consumer) = handoff();
            let writer = thread::spawn(move || {
                for i in 0..frames {
                    producer.publish(vec![i as f32; len]);
                }
            });

            let mut last: Option<f32> = None;
            while let Ok(frame) = consumer.fetch(Duration::from_millis(200)) {
                prop_assert_eq!(frame.len(), len);
                let first = frame[0];
                prop_assert!(frame.iter().all(|s| *s == first));
                if let Some(prev) = last {
                    prop_assert!(first > prev);
                }
                last = Some(first);
            }
            writer.join().unwrap();
            prop_assert_eq!(last, Some((frames - 1) as f32));
        }
    }
}
