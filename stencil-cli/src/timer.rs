use std::time::{Duration, Instant};

use stencil_core::{Diagnostics, Instrument, Phase};

/// Wall-clock time per phase plus every diagnostics sample of one run
#[derive(Debug, Default)]
pub struct PhaseTimer {
    started: [Option<Instant>; Phase::ALL.len()],
    spent: [Duration; Phase::ALL.len()],
    pub samples: Vec<Diagnostics>,
}

fn slot(phase: Phase) -> usize {
    Phase::ALL.iter().position(|&p| p == phase).unwrap_or(0)
}

impl PhaseTimer {
    pub fn spent(&self, phase: Phase) -> Duration {
        self.spent[slot(phase)]
    }
}

impl Instrument for PhaseTimer {
    fn begin(&mut self, phase: Phase) {
        self.started[slot(phase)] = Some(Instant::now());
    }

    fn end(&mut self, phase: Phase) {
        if let Some(t0) = self.started[slot(phase)].take() {
            self.spent[slot(phase)] += t0.elapsed();
        }
    }

    fn sample(&mut self, diagnostics: &Diagnostics) {
        self.samples.push(*diagnostics);
    }
}
