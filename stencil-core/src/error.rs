use rayon::ThreadPoolBuildError;
use thiserror::Error;

use crate::simulation::Status;

/// Things that can go wrong while setting up or driving a simulation
#[derive(Debug, Error)]
pub enum SolverError {
    /// Field buffers could not be obtained; nothing was left allocated
    #[error("failed to allocate {fields} field(s) of {rows}x{cols} cells")]
    Allocation {
        fields: usize,
        rows: usize,
        cols: usize,
    },

    /// A configuration value is outside its validated range
    #[error("invalid {name} = {value}: {reason}")]
    InvalidParameter {
        name: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("failed to configure worker thread pool")]
    ThreadPool(#[from] ThreadPoolBuildError),

    /// Operation not allowed in the simulation's current lifecycle state
    #[error("cannot {operation} while simulation is {status:?}")]
    InvalidState {
        operation: &'static str,
        status: Status,
    },

    #[error("field data has {found} values, grid needs {expected}")]
    FieldLength { expected: usize, found: usize },

    #[error("partition built for a {partition_rows}x{partition_cols} grid, field {field:?} is {rows}x{cols}")]
    GridMismatch {
        field: String,
        rows: usize,
        cols: usize,
        partition_rows: usize,
        partition_cols: usize,
    },

    #[error("no field named {0:?}")]
    UnknownField(String),
}

impl SolverError {
    pub(crate) fn invalid(name: &'static str, value: impl ToString, reason: &'static str) -> Self {
        SolverError::InvalidParameter {
            name,
            value: value.to_string(),
            reason,
        }
    }
}

pub type Result<T> = std::result::Result<T, SolverError>;
