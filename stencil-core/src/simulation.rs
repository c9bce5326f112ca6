use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, trace, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::boundary::{self, BoundarySpec};
use crate::diagnostics::Diagnostics;
use crate::error::{Result, SolverError};
use crate::field::{Field, Grid};
use crate::init::Perturbation;
use crate::instrument::{Instrument, Phase, within};
use crate::schedule::Schedule;
use crate::stencil::{self, StencilParams};

pub const MAX_THREADS: usize = 1024;
pub const MAX_EDGE: usize = 1 << 16;

/// A tracked scalar and the amplitude its perturbation is seeded with
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub amplitude: f64,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, amplitude: f64) -> FieldSpec {
        FieldSpec {
            name: name.into(),
            amplitude,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SimulationConfig {
    pub rows: usize,
    pub cols: usize,
    pub iterations: usize,
    pub threads: usize,
    pub params: StencilParams,
    pub schedule: Schedule,
    pub boundary: BoundarySpec,
    pub fields: Vec<FieldSpec>,
    pub perturbation: Perturbation,
    /// Sample diagnostics every this many iterations (and after the last)
    pub diagnostics_every: Option<usize>,
    /// Cap in bytes on field buffers; `initialize` fails past it
    pub memory_limit: Option<usize>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        SimulationConfig::square(1024)
    }
}

impl SimulationConfig {
    /// Velocity pair `u`, `v` on an `n x n` grid with a centred Gaussian bump
    pub fn square(n: usize) -> SimulationConfig {
        SimulationConfig {
            rows: n,
            cols: n,
            iterations: 3000,
            threads: 8,
            params: StencilParams::default(),
            schedule: Schedule::default(),
            boundary: BoundarySpec::default(),
            fields: vec![FieldSpec::new("u", 0.5), FieldSpec::new("v", 0.3)],
            perturbation: Perturbation::Gaussian {
                radius: (n / 8).max(1) as f64,
            },
            diagnostics_every: None,
            memory_limit: None,
        }
    }

    /// Checks every parameter; nothing is allocated before this passes.
    pub fn validate(&self) -> Result<Grid> {
        if self.rows > MAX_EDGE {
            return Err(SolverError::invalid("rows", self.rows, "grid edge above 65536"));
        }
        if self.cols > MAX_EDGE {
            return Err(SolverError::invalid("cols", self.cols, "grid edge above 65536"));
        }
        let grid = Grid::new(self.rows, self.cols)?;

        if self.iterations == 0 {
            return Err(SolverError::invalid("iterations", 0, "must be >= 1"));
        }
        if self.threads == 0 || self.threads > MAX_THREADS {
            return Err(SolverError::invalid("threads", self.threads, "must be in 1..=1024"));
        }
        self.params.validate()?;
        self.schedule.validate()?;

        if self.fields.is_empty() {
            return Err(SolverError::invalid("fields", 0, "at least one field is required"));
        }
        for (k, spec) in self.fields.iter().enumerate() {
            if self.fields[..k].iter().any(|other| other.name == spec.name) {
                return Err(SolverError::invalid("fields", &spec.name, "duplicate field name"));
            }
            if !spec.amplitude.is_finite() {
                return Err(SolverError::invalid("amplitude", spec.amplitude, "must be finite"));
            }
        }
        if let Perturbation::Gaussian { radius } = self.perturbation {
            if !(radius.is_finite() && radius > 0.0) {
                return Err(SolverError::invalid("radius", radius, "must be finite and > 0"));
            }
        }
        if self.diagnostics_every == Some(0) {
            return Err(SolverError::invalid("diagnostics_every", 0, "must be >= 1"));
        }
        Ok(grid)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Status {
    Uninitialized,
    Initialized,
    Running,
    Completed,
    Failed,
}

/// Fields and scalar parameters, owned by the driver
#[derive(Debug)]
pub struct SimulationState {
    fields: Vec<Field>,
    params: StencilParams,
    iterations: usize,
    completed: usize,
}

impl SimulationState {
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn params(&self) -> StencilParams {
        self.params
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn completed(&self) -> usize {
        self.completed
    }
}

#[derive(Debug)]
pub struct Simulation {
    config: SimulationConfig,
    grid: Grid,
    pool: ThreadPool,
    status: Status,
    state: Option<SimulationState>,
}

impl Simulation {
    /// Validates `config` and starts the worker pool. No field memory is
    /// allocated until [`Simulation::initialize`].
    pub fn new(config: SimulationConfig) -> Result<Simulation> {
        let grid = config.validate()?;
        if config.params.stability_number() >= 1.0 {
            warn!(
                "4*dt*nu = {} >= 1: explicit update is unstable at this time step",
                config.params.stability_number()
            );
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .thread_name(|i| format!("stencil-{i}"))
            .build()?;
        debug!(
            "simulation {}x{}, {} iterations, {} threads, schedule {}",
            grid.rows(),
            grid.cols(),
            config.iterations,
            config.threads,
            config.schedule
        );
        Ok(Simulation {
            config,
            grid,
            pool,
            status: Status::Uninitialized,
            state: None,
        })
    }

    // ---- Accessors ----

    pub fn config(&self) -> &SimulationConfig {
        &self.config
    }

    pub fn grid(&self) -> Grid {
        self.grid
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn state(&self) -> Option<&SimulationState> {
        self.state.as_ref()
    }

    pub fn into_state(self) -> Option<SimulationState> {
        self.state
    }

    pub fn fields(&self) -> &[Field] {
        self.state.as_ref().map_or(&[], |s| &s.fields)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.state.as_ref()?.field(name)
    }

    // ---- Lifecycle ----

    /// Allocates, seeds and settles every field, dropping any earlier state.
    /// An allocation failure leaves nothing allocated and the status Failed.
    pub fn initialize<I: Instrument + ?Sized>(&mut self, instrument: &mut I) -> Result<()> {
        if self.status == Status::Running {
            return Err(SolverError::InvalidState {
                operation: "initialize",
                status: self.status,
            });
        }
        self.state = None;

        let grid = self.grid;
        let config = &self.config;
        let pool = &self.pool;
        let fields = within(instrument, Phase::Initialize, || {
            pool.install(|| -> Result<Vec<Field>> {
                let mut budget = config.memory_limit.unwrap_or(usize::MAX);
                let mut fields = config
                    .fields
                    .iter()
                    .map(|spec| {
                        budget = budget.checked_sub(Field::footprint(grid)).ok_or_else(|| {
                            warn!("field {:?} exceeds the memory limit", spec.name);
                            SolverError::Allocation {
                                fields: 1,
                                rows: grid.rows(),
                                cols: grid.cols(),
                            }
                        })?;
                        Field::allocate(spec.name.clone(), grid)
                    })
                    .collect::<Result<Vec<_>>>()
                    .map_err(|_| SolverError::Allocation {
                        fields: config.fields.len(),
                        rows: grid.rows(),
                        cols: grid.cols(),
                    })?;
                for (field, spec) in fields.iter_mut().zip(&config.fields) {
                    config.perturbation.seed(field, spec.amplitude);
                }
                boundary::apply_all(&mut fields, config.boundary);
                Ok(fields)
            })
        });

        match fields {
            Ok(fields) => {
                debug!("initialised {} field(s) with {:?}", fields.len(), config.perturbation);
                self.state = Some(SimulationState {
                    fields,
                    params: config.params,
                    iterations: config.iterations,
                    completed: 0,
                });
                self.status = Status::Initialized;
                Ok(())
            }
            Err(e) => {
                self.status = Status::Failed;
                Err(e)
            }
        }
    }

    /// Replaces the current values of field `name` before the first
    /// iteration. The boundary is re-applied afterwards.
    pub fn load_field(&mut self, name: &str, values: &[f64]) -> Result<()> {
        self.require(&[Status::Initialized], "load field")?;
        let spec = self.config.boundary;
        let state = self.state_mut("load field")?;
        let field = state
            .fields
            .iter_mut()
            .find(|f| f.name() == name)
            .ok_or_else(|| SolverError::UnknownField(name.to_string()))?;
        field.load(values)?;
        boundary::apply(field, spec);
        Ok(())
    }

    pub fn step<I: Instrument + ?Sized>(&mut self, instrument: &mut I) -> Result<()> {
        self.require(&[Status::Initialized, Status::Running], "step")?;
        self.status = Status::Running;
        self.advance(instrument)
    }

    pub fn run<I: Instrument + ?Sized>(&mut self, instrument: &mut I) -> Result<()> {
        let never = AtomicBool::new(false);
        self.run_until(instrument, &never).map(|_| ())
    }

    /// Runs remaining iterations, checking `cancel` between iterations.
    /// A cancelled run stays [`Status::Running`] and may be resumed.
    pub fn run_until<I: Instrument + ?Sized>(
        &mut self,
        instrument: &mut I,
        cancel: &AtomicBool,
    ) -> Result<Status> {
        self.require(&[Status::Initialized, Status::Running], "run")?;
        self.status = Status::Running;
        while self.status == Status::Running {
            if cancel.load(Ordering::Relaxed) {
                let done = self.state.as_ref().map_or(0, |s| s.completed);
                info!("run cancelled after {done} iteration(s)");
                break;
            }
            self.advance(instrument)?;
        }
        Ok(self.status)
    }

    fn advance<I: Instrument + ?Sized>(&mut self, instrument: &mut I) -> Result<()> {
        let grid = self.grid;
        let boundary_spec = self.config.boundary;
        let schedule = self.config.schedule;
        let every = self.config.diagnostics_every;
        let pool = &self.pool;
        let Some(state) = self.state.as_mut() else {
            return Err(SolverError::InvalidState {
                operation: "step",
                status: self.status,
            });
        };

        let partition = schedule.partition(grid, pool.current_num_threads());
        within(instrument, Phase::Update, || {
            stencil::update(&mut state.fields, &state.params, &partition, pool)
        })?;
        within(instrument, Phase::Swap, || {
            state.fields.iter_mut().for_each(Field::swap)
        });
        within(instrument, Phase::Boundary, || {
            pool.install(|| boundary::apply_all(&mut state.fields, boundary_spec))
        });
        state.completed += 1;
        trace!("iteration {} of {} done", state.completed, state.iterations);

        let finished = state.completed >= state.iterations;
        if let Some(every) = every {
            if state.completed % every == 0 || finished {
                let sample = within(instrument, Phase::Diagnostics, || {
                    pool.install(|| Diagnostics::sample(state.completed, &state.fields))
                });
                debug!(
                    "iteration {}: energy = {:.6}, max divergence = {:.6e}",
                    sample.iteration, sample.kinetic_energy, sample.max_divergence
                );
                instrument.sample(&sample);
            }
        }
        if finished {
            info!("completed {} iterations with schedule {}", state.completed, schedule);
            self.status = Status::Completed;
        }
        Ok(())
    }

    fn require(&self, allowed: &[Status], operation: &'static str) -> Result<()> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(SolverError::InvalidState {
                operation,
                status: self.status,
            })
        }
    }

    fn state_mut(&mut self, operation: &'static str) -> Result<&mut SimulationState> {
        let status = self.status;
        self.state
            .as_mut()
            .ok_or(SolverError::InvalidState { operation, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::NoInstrument;

    fn small(n: usize, iterations: usize) -> SimulationConfig {
        SimulationConfig {
            iterations,
            threads: 2,
            ..SimulationConfig::square(n)
        }
    }

    #[test]
    fn default_matches_reference_setup() {
        let c = SimulationConfig::default();
        assert_eq!((c.rows, c.cols, c.iterations, c.threads), (1024, 1024, 3000, 8));
        assert_eq!(c.params, StencilParams { dt: 1e-5, diffusion: 0.1 });
        assert_eq!(c.perturbation, Perturbation::Gaussian { radius: 128.0 });
        assert_eq!(c.fields.len(), 2);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn invalid_parameters_rejected_before_allocation() {
        let bad = [
            SimulationConfig { rows: 2, ..small(8, 1) },
            SimulationConfig { cols: MAX_EDGE + 1, ..small(8, 1) },
            SimulationConfig { iterations: 0, ..small(8, 1) },
            SimulationConfig { threads: 0, ..small(8, 1) },
            SimulationConfig { fields: vec![], ..small(8, 1) },
            SimulationConfig {
                fields: vec![FieldSpec::new("u", 1.0), FieldSpec::new("u", 2.0)],
                ..small(8, 1)
            },
            SimulationConfig { diagnostics_every: Some(0), ..small(8, 1) },
            SimulationConfig { schedule: Schedule::Dynamic { chunk: 0 }, ..small(8, 1) },
        ];
        for config in bad {
            assert!(
                matches!(Simulation::new(config.clone()), Err(SolverError::InvalidParameter { .. })),
                "{config:?}"
            );
        }
    }

    #[test]
    fn lifecycle_transitions() {
        let mut sim = Simulation::new(small(16, 3)).unwrap();
        assert_eq!(sim.status(), Status::Uninitialized);
        assert!(sim.fields().is_empty());
        assert!(matches!(
            sim.step(&mut NoInstrument),
            Err(SolverError::InvalidState { status: Status::Uninitialized, .. })
        ));

        sim.initialize(&mut NoInstrument).unwrap();
        assert_eq!(sim.status(), Status::Initialized);

        sim.step(&mut NoInstrument).unwrap();
        assert_eq!(sim.status(), Status::Running);
        assert!(sim.load_field("u", &[0.0; 256]).is_err());

        sim.run(&mut NoInstrument).unwrap();
        assert_eq!(sim.status(), Status::Completed);
        assert_eq!(sim.state().unwrap().completed(), 3);
        assert!(sim.step(&mut NoInstrument).is_err());

        // re-initialising resets a finished run
        sim.initialize(&mut NoInstrument).unwrap();
        assert_eq!(sim.status(), Status::Initialized);
        assert_eq!(sim.state().unwrap().completed(), 0);
    }

    #[test]
    fn allocation_failure_leaves_nothing_behind() {
        let grid = Grid::square(32).unwrap();
        let config = SimulationConfig {
            memory_limit: Some(Field::footprint(grid) + Field::footprint(grid) / 2),
            ..small(32, 4)
        };
        let mut sim = Simulation::new(config).unwrap();
        let err = sim.initialize(&mut NoInstrument).unwrap_err();
        assert!(matches!(err, SolverError::Allocation { fields: 2, rows: 32, cols: 32 }));
        assert_eq!(sim.status(), Status::Failed);
        assert!(sim.state().is_none());
        assert!(sim.fields().is_empty());
        assert!(matches!(
            sim.run(&mut NoInstrument),
            Err(SolverError::InvalidState { status: Status::Failed, .. })
        ));

        let config = SimulationConfig {
            memory_limit: Some(2 * Field::footprint(grid)),
            ..small(32, 4)
        };
        let mut sim = Simulation::new(config).unwrap();
        sim.initialize(&mut NoInstrument).unwrap();
        assert_eq!(sim.fields().len(), 2);
    }

    #[test]
    fn cancellation_is_checked_between_iterations() {
        let mut sim = Simulation::new(small(16, 10)).unwrap();
        sim.initialize(&mut NoInstrument).unwrap();
        let cancel = AtomicBool::new(true);
        let status = sim.run_until(&mut NoInstrument, &cancel).unwrap();
        assert_eq!(status, Status::Running);
        assert_eq!(sim.state().unwrap().completed(), 0);

        cancel.store(false, Ordering::Relaxed);
        assert_eq!(sim.run_until(&mut NoInstrument, &cancel).unwrap(), Status::Completed);
    }

    #[test]
    fn load_field_reapplies_boundary() {
        let mut sim = Simulation::new(small(4, 1)).unwrap();
        sim.initialize(&mut NoInstrument).unwrap();
        sim.load_field("v", &[1.0; 16]).unwrap();
        let v = sim.field("v").unwrap();
        assert_eq!(v.get(1, 1), 1.0);
        assert_eq!(v.get(0, 1), 0.0);

        assert!(matches!(sim.load_field("w", &[1.0; 16]), Err(SolverError::UnknownField(_))));
        assert!(matches!(
            sim.load_field("u", &[1.0; 15]),
            Err(SolverError::FieldLength { expected: 16, found: 15 })
        ));
    }

    #[test]
    fn diagnostics_sampled_on_interval_and_at_end() {
        let config = SimulationConfig {
            diagnostics_every: Some(4),
            ..small(16, 10)
        };
        let mut sim = Simulation::new(config).unwrap();
        let mut samples: Vec<Diagnostics> = Vec::new();
        sim.initialize(&mut samples).unwrap();
        sim.run(&mut samples).unwrap();
        let at: Vec<usize> = samples.iter().map(|d| d.iteration).collect();
        assert_eq!(at, vec![4, 8, 10]);
        assert!(samples.windows(2).all(|w| w[1].kinetic_energy <= w[0].kinetic_energy));
    }
}
