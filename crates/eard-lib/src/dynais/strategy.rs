//! Lag matching strategies
//!
//! A strategy advances the per-lag match runs of one level when a new token
//! arrives. `runs[d]` is the number of consecutive tokens that equalled the
//! token `d` positions before them. Every strategy must leave `runs` in the
//! same state; they differ only in how many lags they compare per step.

use super::window::{Token, Window};

/// Strategy for updating per-lag match runs
pub trait LagStrategy: Send {
    fn name(&self) -> &'static str;

    /// Update `runs[1..]` for `token`, before it is pushed into `window`
    ///
    /// Lags beyond the current history length reset to zero.
    fn update_runs(&self, window: &Window, token: Token, runs: &mut [u32]);
}

/// One lag per comparison
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarLag;

impl LagStrategy for ScalarLag {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn update_runs(&self, window: &Window, token: Token, runs: &mut [u32]) {
        for lag in 1..runs.len() {
            runs[lag] = match window.at_lag(lag) {
                Some(prev) if prev == token => runs[lag].saturating_add(1),
                _ => 0,
            };
        }
    }
}

/// `N` consecutive lags per comparison block
///
/// Values and sizes of a block are gathered into fixed arrays and compared
/// lane by lane, then runs are updated without branching.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaneLag<const N: usize>;

pub type Lanes4 = LaneLag<4>;
pub type Lanes8 = LaneLag<8>;
pub type Lanes16 = LaneLag<16>;

impl<const N: usize> LagStrategy for LaneLag<N> {
    fn name(&self) -> &'static str {
        match N {
            4 => "lanes4",
            8 => "lanes8",
            16 => "lanes16",
            _ => "lanes",
        }
    }

    fn update_runs(&self, window: &Window, token: Token, runs: &mut [u32]) {
        let hist = window.as_slice();
        let n = hist.len();
        let max_lag = runs.len().saturating_sub(1);

        let mut lag = 1;
        while lag <= max_lag {
            let width = N.min(max_lag + 1 - lag);

            if N > 0 && width == N && lag + N - 1 <= n {
                let mut values = [0u64; N];
                let mut sizes = [0u32; N];
                for lane in 0..N {
                    let prev = hist[n - (lag + lane)];
                    values[lane] = prev.value;
                    sizes[lane] = prev.size;
                }

                let mut eq = [0u32; N];
                for lane in 0..N {
                    eq[lane] = ((values[lane] == token.value) & (sizes[lane] == token.size)) as u32;
                }
                for lane in 0..N {
                    runs[lag + lane] = runs[lag + lane].saturating_add(1) * eq[lane];
                }
                lag += N;
            } else {
                // Partial block at the end of the range or of the history
                let step = width.max(1);
                for d in lag..lag + step {
                    runs[d] = if d <= n && hist[n - d] == token {
                        runs[d].saturating_add(1)
                    } else {
                        0
                    };
                }
                lag += step;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive<S: LagStrategy>(strategy: &S, capacity: usize, values: &[u64]) -> Vec<Vec<u32>> {
        let mut window = Window::new(capacity);
        let mut runs = vec![0u32; capacity + 1];
        let mut history = Vec::new();

        for &v in values {
            let token = Token::sample(v);
            strategy.update_runs(&window, token, &mut runs);
            window.push(token);
            history.push(runs.clone());
        }
        history
    }

    #[test]
    fn test_scalar_runs_on_period_three() {
        let values = [1, 2, 3, 1, 2, 3, 1];
        let history = drive(&ScalarLag, 6, &values);

        let last = history.last().unwrap();
        assert_eq!(last[3], 4);
        assert_eq!(last[1], 0);
        assert_eq!(last[2], 0);
        assert_eq!(last[6], 1);
    }

    #[test]
    fn test_lanes_match_scalar_runs() {
        let mut seed = 7u64;
        let values: Vec<u64> = (0..500)
            .map(|i| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                if i % 50 < 35 {
                    (i % 7) as u64
                } else {
                    seed >> 60
                }
            })
            .collect();

        for capacity in [1usize, 3, 4, 9, 16, 33] {
            let scalar = drive(&ScalarLag, capacity, &values);
            assert_eq!(scalar, drive(&Lanes4::default(), capacity, &values));
            assert_eq!(scalar, drive(&Lanes8::default(), capacity, &values));
            assert_eq!(scalar, drive(&Lanes16::default(), capacity, &values));
        }
    }
}
