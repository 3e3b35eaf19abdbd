use std::sync::Mutex;

use anyhow::bail;
use tracing::trace;

/// Hands out network ports to concurrently running games.
///
/// Ports are strictly increasing from `base` and never recycled within a run, since a port
/// used once may still be in the OS's reuse window.
#[derive(Debug)]
pub struct PortAllocator {
    base: u16,
    next: Mutex<Option<u16>>,
}

impl PortAllocator {
    pub fn new(base: u16) -> PortAllocator {
        PortAllocator {
            base,
            next: Mutex::new(Some(base)),
        }
    }

    /// Next free port.
    ///
    /// # Errors
    /// Fails once the port space above `base` is exhausted. This is a configuration error
    /// and should abort the run.
    pub fn allocate(&self) -> anyhow::Result<u16> {
        let mut guard = self.next.lock().expect("poisoned");
        let Some(port) = *guard else {
            bail!("port space exhausted (base port {})", self.base);
        };
        *guard = port.checked_add(1);
        trace!(port, "allocated port");
        Ok(port)
    }

    pub fn base(&self) -> u16 {
        self.base
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashSet, sync::Arc, thread};

    use super::*;

    #[test]
    fn increasing_from_base() {
        let ports = PortAllocator::new(9600);
        assert_eq!(ports.allocate().unwrap(), 9600);
        assert_eq!(ports.allocate().unwrap(), 9601);
        assert_eq!(ports.allocate().unwrap(), 9602);
    }

    #[test]
    fn exhaustion_is_an_error() {
        let ports = PortAllocator::new(u16::MAX - 1);
        assert_eq!(ports.allocate().unwrap(), u16::MAX - 1);
        assert_eq!(ports.allocate().unwrap(), u16::MAX);
        assert!(ports.allocate().is_err());
        assert!(ports.allocate().is_err());
    }

    #[test]
    fn concurrent_allocations_are_distinct() {
        let ports = Arc::new(PortAllocator::new(10_000));
        let handles = (0..8)
            .map(|_| {
                let ports = ports.clone();
                thread::spawn(move || {
                    (0..50)
                        .map(|_| ports.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>();

        let mut all = vec![];
        for handle in handles {
            let ports = handle.join().unwrap();
            // each worker sees its own ports strictly increasing
            assert!(ports.windows(2).all(|w| w[0] < w[1]));
            all.extend(ports);
        }
        let distinct = all.iter().copied().collect::<HashSet<_>>();
        assert_eq!(distinct.len(), 400);
        assert_eq!(*all.iter().min().unwrap(), 10_000);
        assert_eq!(*all.iter().max().unwrap(), 10_399);
    }
}
