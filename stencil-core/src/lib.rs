pub mod boundary;
pub mod diagnostics;
pub mod error;
pub mod field;
pub mod init;
pub mod instrument;
pub mod schedule;
pub mod simulation;
pub mod stencil;

pub use boundary::BoundarySpec;
pub use diagnostics::Diagnostics;
pub use error::{Result, SolverError};
pub use field::{Field, Grid};
pub use init::Perturbation;
pub use instrument::{Instrument, NoInstrument, Phase};
pub use schedule::{Dispatch, PartitionCoverageError, Schedule, WorkPartition, WorkUnit};
pub use simulation::{FieldSpec, Simulation, SimulationConfig, SimulationState, Status};
pub use stencil::StencilParams;
