use crate::diagnostics::Diagnostics;

/// Named stretches of a simulation a profiler may bracket
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Initialize,
    Update,
    Swap,
    Boundary,
    Diagnostics,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Initialize,
        Phase::Update,
        Phase::Swap,
        Phase::Boundary,
        Phase::Diagnostics,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Initialize => "initialize",
            Phase::Update => "update",
            Phase::Swap => "swap",
            Phase::Boundary => "boundary",
            Phase::Diagnostics => "diagnostics",
        }
    }
}

/// Hooks called by the driver from its orchestrating thread. All methods
/// default to doing nothing.
pub trait Instrument {
    fn begin(&mut self, _phase: Phase) {}

    fn end(&mut self, _phase: Phase) {}

    fn sample(&mut self, _diagnostics: &Diagnostics) {}
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoInstrument;

impl Instrument for NoInstrument {}

/// Collects every diagnostics sample
impl Instrument for Vec<Diagnostics> {
    fn sample(&mut self, diagnostics: &Diagnostics) {
        self.push(*diagnostics);
    }
}

impl<I: Instrument + ?Sized> Instrument for &mut I {
    fn begin(&mut self, phase: Phase) {
        (**self).begin(phase);
    }

    fn end(&mut self, phase: Phase) {
        (**self).end(phase);
    }

    fn sample(&mut self, diagnostics: &Diagnostics) {
        (**self).sample(diagnostics);
    }
}

pub(crate) fn within<I, R>(instrument: &mut I, phase: Phase, f: impl FnOnce() -> R) -> R
where
    I: Instrument + ?Sized,
{
    instrument.begin(phase);
    let out = f();
    instrument.end(phase);
    out
}
