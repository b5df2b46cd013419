//! Per-level history of the most recent tokens

/// One entry of a level's history
///
/// Level 0 carries raw samples with `size == 1`; higher levels carry the
/// sample that closed a confirmed loop together with that loop's size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub value: u64,
    pub size: u32,
}

impl Token {
    pub fn sample(value: u64) -> Self {
        Self { value, size: 1 }
    }
}

/// Fixed-capacity history, oldest first
///
/// Backed by a buffer twice the capacity that is compacted when the front
/// runs out, so the live tokens are always one contiguous slice.
#[derive(Debug, Clone)]
pub struct Window {
    buf: Vec<Token>,
    start: usize,
    capacity: usize,
}

impl Window {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity * 2),
            start: 0,
            capacity,
        }
    }

    pub fn push(&mut self, token: Token) {
        if self.len() == self.capacity {
            self.start += 1;
        }
        self.buf.push(token);

        if self.start >= self.capacity {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }

    /// Token `lag` positions before the newest (lag 1 is the newest)
    pub fn at_lag(&self, lag: usize) -> Option<Token> {
        let live = self.as_slice();
        if lag == 0 || lag > live.len() {
            return None;
        }
        Some(live[live.len() - lag])
    }

    pub fn as_slice(&self) -> &[Token] {
        &self.buf[self.start..]
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.start = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_keeps_last_capacity_tokens() {
        let mut window = Window::new(3);
        for v in 0..10u64 {
            window.push(Token::sample(v));
            assert!(window.len() <= 3);
        }

        let values: Vec<u64> = window.as_slice().iter().map(|t| t.value).collect();
        assert_eq!(values, vec![7, 8, 9]);
        assert_eq!(window.at_lag(1), Some(Token::sample(9)));
        assert_eq!(window.at_lag(3), Some(Token::sample(7)));
        assert_eq!(window.at_lag(4), None);
        assert_eq!(window.at_lag(0), None);
    }

    #[test]
    fn test_window_warm_up_and_clear() {
        let mut window = Window::new(5);
        window.push(Token::sample(1));
        window.push(Token::sample(2));
        assert_eq!(window.len(), 2);

        window.clear();
        assert!(window.is_empty());
        assert_eq!(window.capacity(), 5);
    }
}
