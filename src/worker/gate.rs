use parking_lot::{Condvar, Mutex};

/// Counting gate that caps in-flight work against one worker service.
#[derive(Debug)]
pub struct ConcurrencyGate {
    limit: usize,
    in_flight: Mutex<usize>,
    freed: Condvar,
}

impl ConcurrencyGate {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            in_flight: Mutex::new(0),
            freed: Condvar::new(),
        }
    }

    /// Blocks until a slot is free. The slot is released when the permit drops.
    pub fn acquire(&self) -> Permit<'_> {
        let mut n = self.in_flight.lock();
        while *n >= self.limit {
            self.freed.wait(&mut n);
        }
        *n += 1;
        Permit { gate: self }
    }

    pub fn in_flight(&self) -> usize {
        *self.in_flight.lock()
    }
}

#[derive(Debug)]
pub struct Permit<'a> {
    gate: &'a ConcurrencyGate,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        let mut n = self.gate.in_flight.lock();
        *n = n.saturating_sub(1);
        self.gate.freed.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn never_exceeds_limit() {
        let gate = ConcurrencyGate::new(2);
        let peak = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for _ in 0..6 {
                s.spawn(|| {
                    let _permit = gate.acquire();
                    peak.fetch_max(gate.in_flight(), Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(10));
                });
            }
        });
        assert!(peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(gate.in_flight(), 0);
    }
}
