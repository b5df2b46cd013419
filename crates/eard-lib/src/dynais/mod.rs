//! Loop and phase signature detection
//!
//! The detector classifies a live stream of instrumentation samples into
//! periodic phases so the daemon reconfigures once per phase instead of
//! once per sample. Each nesting level keeps a window of its most recent
//! tokens and, per candidate lag, the length of the current match run. A
//! lag is verified once its run covers a full period; the stability counter
//! of a verified lag advances on every period boundary and a
//! [`LoopEvent`] is emitted once it reaches the configured threshold.
//!
//! When a level confirms a loop it forwards a `(sample, size)` token to the
//! next level, so a sequence of inner loops can itself be recognised as an
//! outer loop. While an outer loop is reported and stable, restarts of its
//! inner loops are counted as iterations of the outer one and produce no
//! events.
//!
//! The detector is single-threaded: one instance per sampling thread.

mod strategy;
mod window;

#[cfg(test)]
mod tests;

pub use strategy::{LagStrategy, LaneLag, Lanes16, Lanes4, Lanes8, ScalarLag};
pub use window::{Token, Window};

use serde::{Deserialize, Serialize};

use crate::error::{EardError, Result};

/// Upper bound on nesting levels
pub const MAX_LEVELS: usize = 10;

/// Instrumentation point identifier
pub type Sample = u64;

/// Detector configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Samples kept per level; also the longest detectable period
    pub window_size: usize,
    /// Nesting levels, clamped to [`MAX_LEVELS`]
    pub levels: usize,
    /// Period boundaries needed before a loop is reported
    pub stability_threshold: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_size: 200,
            levels: 10,
            stability_threshold: 2,
        }
    }
}

impl DetectorConfig {
    pub fn new(window_size: usize, levels: usize) -> Self {
        Self {
            window_size,
            levels,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.window_size == 0 {
            return Err(EardError::invalid("window_size must be greater than zero"));
        }
        if self.levels == 0 {
            return Err(EardError::invalid("levels must be greater than zero"));
        }
        if self.stability_threshold == 0 {
            return Err(EardError::invalid("stability_threshold must be greater than zero"));
        }
        Ok(())
    }
}

/// Confirmed periodic phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LoopEvent {
    /// Period in tokens of the reporting level
    pub size: u32,
    /// Nesting level, 0 for the innermost
    pub level: usize,
    /// Number of samples fed when the loop was confirmed
    pub detected_at: u64,
}

/// Per-sample classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStatus {
    NoLoop,
    /// A candidate loop is being tracked but not yet reported
    InLoop,
    /// A period boundary of a reported loop
    NewIteration,
    NewLoop,
    EndLoop,
    /// A loop ended and a new one was reported on the same sample
    EndNewLoop,
}

#[derive(Debug, Default, Clone, Copy)]
struct LevelOutcome {
    emitted: Option<u32>,
    boundary: bool,
    ended: bool,
}

#[derive(Debug, Clone)]
struct Level {
    window: Window,
    runs: Vec<u32>,
    tracked: Option<u32>,
    confirmations: u32,
    reported: bool,
}

impl Level {
    fn new(window_size: usize) -> Self {
        Self {
            window: Window::new(window_size),
            runs: vec![0; window_size + 1],
            tracked: None,
            confirmations: 0,
            reported: false,
        }
    }

    fn reset(&mut self) {
        self.window.clear();
        self.runs.iter_mut().for_each(|r| *r = 0);
        self.forget();
    }

    fn forget(&mut self) {
        self.tracked = None;
        self.confirmations = 0;
        self.reported = false;
    }

    fn is_stable(&self) -> bool {
        self.tracked.is_some() && self.reported
    }

    /// Longest verified lag, ties to the smallest
    ///
    /// A lag whose period is one repeated token is not a loop.
    fn best_lag(&self) -> Option<(u32, u32)> {
        let flat_run = self.runs.get(1).copied().unwrap_or(0) as usize;
        let mut best: Option<(u32, u32)> = None;

        for lag in 2..self.runs.len() {
            let run = self.runs[lag];
            if (run as usize) < lag || flat_run >= lag - 1 {
                continue;
            }
            if best.map_or(true, |(_, r)| run > r) {
                best = Some((lag as u32, run));
            }
        }
        best
    }

    fn push<S: LagStrategy>(
        &mut self,
        token: Token,
        strategy: &S,
        ready: bool,
        threshold: u32,
    ) -> LevelOutcome {
        strategy.update_runs(&self.window, token, &mut self.runs);
        self.window.push(token);

        let mut out = LevelOutcome::default();
        let Some((lag, run)) = self.best_lag() else {
            if self.tracked.is_some() {
                self.forget();
                out.ended = true;
            }
            return out;
        };

        if self.tracked != Some(lag) {
            out.ended = self.tracked.is_some();
            self.forget();
            self.tracked = Some(lag);
        }

        if run % lag == 0 {
            out.boundary = true;
            self.confirmations = self.confirmations.saturating_add(1);

            if !self.reported && ready && self.confirmations >= threshold {
                self.reported = true;
                out.emitted = Some(lag);
            }
        }
        out
    }
}

/// Hierarchical loop detector
#[derive(Debug, Clone)]
pub struct SignatureDetector<S: LagStrategy = ScalarLag> {
    config: DetectorConfig,
    levels: Vec<Level>,
    strategy: S,
    fed: u64,
    status: LoopStatus,
}

impl SignatureDetector<ScalarLag> {
    /// Create a detector with the scalar lag strategy
    ///
    /// # Errors
    /// `InvalidArgument` when `window_size`, `levels` or
    /// `stability_threshold` is zero.
    pub fn new(config: DetectorConfig) -> Result<Self> {
        Self::with_strategy(config, ScalarLag)
    }
}

impl<S: LagStrategy> SignatureDetector<S> {
    pub fn with_strategy(mut config: DetectorConfig, strategy: S) -> Result<Self> {
        config.validate()?;
        config.levels = config.levels.min(MAX_LEVELS);

        let levels = (0..config.levels)
            .map(|_| Level::new(config.window_size))
            .collect();

        Ok(Self {
            config,
            levels,
            strategy,
            fed: 0,
            status: LoopStatus::NoLoop,
        })
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Classification of the last fed sample
    pub fn status(&self) -> LoopStatus {
        self.status
    }

    /// Samples fed since creation or the last reset
    pub fn samples(&self) -> u64 {
        self.fed
    }

    /// Period currently tracked at `level`, reported or not
    pub fn tracked_size(&self, level: usize) -> Option<u32> {
        self.levels.get(level).and_then(|l| l.tracked)
    }

    /// Drop all history, as a fresh detector would start
    pub fn reset(&mut self) {
        self.levels.iter_mut().for_each(Level::reset);
        self.fed = 0;
        self.status = LoopStatus::NoLoop;
    }

    /// Consume one sample
    pub fn feed(&mut self, sample: Sample) -> Option<LoopEvent> {
        self.fed += 1;
        let ready = self.fed >= self.config.window_size as u64;
        let threshold = self.config.stability_threshold;

        let mut token = Token::sample(sample);
        let mut highest: Option<(usize, u32)> = None;
        let mut ended = false;
        let mut boundary = false;

        for level in 0..self.levels.len() {
            let out = self.levels[level].push(token, &self.strategy, ready, threshold);
            ended |= out.ended;
            boundary |= out.boundary;

            let Some(size) = out.emitted else {
                break;
            };

            highest = Some((level, size));
            for inner in &mut self.levels[..level] {
                inner.confirmations = 0;
            }
            token = Token {
                value: sample,
                size,
            };
        }

        let event = highest.and_then(|(level, size)| {
            let outer_stable = self.levels[level + 1..].iter().any(Level::is_stable);
            (!outer_stable).then_some(LoopEvent {
                size,
                level,
                detected_at: self.fed,
            })
        });

        self.status = match (event.is_some(), ended) {
            (true, true) => LoopStatus::EndNewLoop,
            (true, false) => LoopStatus::NewLoop,
            (false, true) => LoopStatus::EndLoop,
            (false, false) if highest.is_some() => LoopStatus::NewIteration,
            (false, false) if boundary && self.levels.iter().any(Level::is_stable) => {
                LoopStatus::NewIteration
            }
            (false, false) if self.levels.iter().any(|l| l.tracked.is_some()) => {
                LoopStatus::InLoop
            }
            (false, false) => LoopStatus::NoLoop,
        };

        event
    }
}
