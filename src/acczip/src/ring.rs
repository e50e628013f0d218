use crossbeam_queue::ArrayQueue;

use super::*;

#[derive(Debug)]
pub(crate) struct RequestRing<T> {
    queue: ArrayQueue<T>,
}

impl<T> RequestRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
        }
    }

    pub fn enqueue(&self, item: T) -> Result<(), T> {
        self.queue.push(item)
    }

    pub fn dequeue(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[cfg(test)]
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    #[cfg(test)]
    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    pub fn post(&self) {
        if let Ok(mut permits) = self.permits.lock() {
            *permits = permits.saturating_add(1);
            self.available.notify_one();
        }
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, AcczipError> {
        let deadline = Instant::now() + timeout;
        let mut permits = lock(&self.permits)?;
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            permits = wait_timeout_on_condvar(&self.available, permits, deadline - now)?;
        }
        *permits -= 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    #[test]
    fn ring_is_fifo_and_bounded() {
        let ring = RequestRing::new(3);
        for value in 0..3 {
            ring.enqueue(value).expect("ring has room");
        }
        assert!(ring.is_full());
        assert_eq!(ring.enqueue(3), Err(3));
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.dequeue(), Some(0));
        assert_eq!(ring.dequeue(), Some(1));
        ring.enqueue(4).expect("room after dequeue");
        assert_eq!(ring.dequeue(), Some(2));
        assert_eq!(ring.dequeue(), Some(4));
        assert_eq!(ring.dequeue(), None);
        assert_eq!(ring.capacity(), 3);
    }

    #[test]
    fn semaphore_wakes_waiter() {
        let semaphore = Arc::new(Semaphore::default());
        assert!(!semaphore
            .wait_timeout(Duration::from_millis(5))
            .expect("wait should not fail"));

        let poster = {
            let semaphore = Arc::clone(&semaphore);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                semaphore.post();
            })
        };
        assert!(semaphore
            .wait_timeout(Duration::from_secs(5))
            .expect("wait should not fail"));
        poster.join().expect("poster should not panic");

        semaphore.post();
        semaphore.post();
        assert!(semaphore.wait_timeout(Duration::ZERO).expect("wait"));
        assert!(semaphore.wait_timeout(Duration::ZERO).expect("wait"));
        assert!(!semaphore.wait_timeout(Duration::ZERO).expect("wait"));
    }
}
