#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    current_ms: Option<u64>,
}

impl Backoff {
    pub const fn new(base_ms: u64, max_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms,
            current_ms: None,
        }
    }

    // Each failure doubles the delay up to the ceiling.
    pub fn next_delay_ms(&mut self) -> u64 {
        let delay = match self.current_ms {
            None => self.base_ms.min(self.max_ms),
            Some(current) => current.saturating_mul(2).min(self.max_ms),
        };
        self.current_ms = Some(delay);
        delay
    }

    pub fn reset(&mut self) {
        self.current_ms = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn delays_are_non_decreasing_up_to_ceiling() {
        let mut backoff = Backoff::new(2_000, 60_000);

        let mut delays = Vec::new();
        for _ in 0..8 {
            delays.push(backoff.next_delay_ms());
        }

        assert_eq!(
            delays,
            vec![2_000, 4_000, 8_000, 16_000, 32_000, 60_000, 60_000, 60_000]
        );
    }

    #[test]
    fn reset_returns_to_minimum() {
        let mut backoff = Backoff::new(2_000, 60_000);
        backoff.next_delay_ms();
        backoff.next_delay_ms();

        backoff.reset();

        assert_eq!(backoff.next_delay_ms(), 2_000);
    }

    #[test]
    fn base_above_ceiling_is_capped() {
        let mut backoff = Backoff::new(90_000, 60_000);
        assert_eq!(backoff.next_delay_ms(), 60_000);
    }
}
