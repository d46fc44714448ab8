use std::sync::atomic::{AtomicU32, Ordering};

/// Request ids live in `[0, REQUEST_ID_SPACE)`
pub const REQUEST_ID_SPACE: u32 = 1 << 31;

/// Monotonic request id source, wrapping at 2^31
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    counter: AtomicU32,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(first: u32) -> Self {
        Self {
            counter: AtomicU32::new(first),
        }
    }

    pub fn next_id(&self) -> u32 {
        self.counter.fetch_add(1, Ordering::Relaxed) & (REQUEST_ID_SPACE - 1)
    }
}

#[cfg(test)]
mod tests {
    use super::{RequestIdGenerator, REQUEST_ID_SPACE};

    #[test]
    fn ids_are_monotonic() {
        let ids = RequestIdGenerator::new();
        let first = ids.next_id();
        let second = ids.next_id();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn ids_wrap_at_two_to_the_31() {
        let ids = RequestIdGenerator::starting_at(REQUEST_ID_SPACE - 1);
        assert_eq!(ids.next_id(), REQUEST_ID_SPACE - 1);
        assert_eq!(ids.next_id(), 0);
        assert_eq!(ids.next_id(), 1);

        let ids = RequestIdGenerator::starting_at(u32::MAX);
        assert_eq!(ids.next_id(), REQUEST_ID_SPACE - 1);
        assert_eq!(ids.next_id(), 0);
    }
}
