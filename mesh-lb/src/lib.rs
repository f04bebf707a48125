pub mod agent;
pub mod bpf;
pub mod config;
pub mod dump;
pub mod http;
pub mod loadbalancer;
pub mod metrics;
pub mod reconciler;
pub mod source;

use std::fmt::Display;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("map error: {0}")]
    MapError(#[from] aya::maps::MapError),

    #[error(
        "unable to update element for lb bpf map: the map is full. Maps are statically sized, \
         resize it with the flag \"--lb-map-max\". The resizing might break existing connections \
         to services"
    )]
    MapFull,

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse desired state: {0}")]
    YamlConversion(#[from] serde_yaml::Error),

    #[error("conversion error: {0}")]
    ConversionError(String),

    #[error("no {kind} id available")]
    NoIdAvailable { kind: &'static str },

    #[error("{kind} id {id} is already registered to {addr}")]
    IdAlreadyRegistered {
        kind: &'static str,
        id: u32,
        addr: String,
    },

    #[error("{kind} id {id} is outside of the range {min}..={max}")]
    IdOutOfRange {
        kind: &'static str,
        id: u32,
        min: u32,
        max: u32,
    },

    #[error("{kind} id not found for {addr}")]
    IdNotFound { kind: &'static str, addr: String },

    #[error("invalid reverse nat id (0) for frontend {0}")]
    InvalidRevNatId(String),

    #[error("frontend {frontend} shares its table rows with {owner}")]
    FrontendConflict { frontend: String, owner: String },

    #[error("{step}: {source}")]
    Reconcile {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },

    #[error("prune failed: {0}")]
    Prune(PruneErrors),

    #[error("reconciler state lock poisoned")]
    LockPoisoned,

    #[error("task failed: {0}")]
    Task(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn metric_label(&self) -> String {
        let label = match self {
            Error::MapError(_) => "map_error",
            Error::MapFull => "map_full",
            Error::IoError(_) => "io_error",
            Error::YamlConversion(_) => "yaml_conversion",
            Error::ConversionError(_) => "conversion_error",
            Error::NoIdAvailable { .. } => "no_id_available",
            Error::IdAlreadyRegistered { .. } => "id_already_registered",
            Error::IdOutOfRange { .. } => "id_out_of_range",
            Error::IdNotFound { .. } => "id_not_found",
            Error::InvalidRevNatId(_) => "invalid_rev_nat_id",
            Error::FrontendConflict { .. } => "frontend_conflict",
            Error::Reconcile { source, .. } => return source.metric_label(),
            Error::Prune(_) => "prune",
            Error::LockPoisoned => "lock_poisoned",
            Error::Task(_) => "task",
            Error::Other(_) => "other",
        };
        label.into()
    }

    /// Whether retrying the same operation can succeed without outside
    /// intervention. A full map has to be resized and a zero reverse nat id is
    /// a bug, neither goes away with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::MapFull | Error::InvalidRevNatId(_) | Error::LockPoisoned => false,
            Error::Reconcile { source, .. } => source.is_retryable(),
            Error::Prune(errors) => errors.0.iter().all(Error::is_retryable),
            _ => true,
        }
    }
}

/// Failures of independent prune sweeps, reported together.
#[derive(Debug, Default)]
pub struct PruneErrors(pub Vec<Error>);

impl Display for PruneErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, e) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{e}")?;
        }
        Ok(())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub(crate) trait StepContext<T> {
    fn step(self, step: &'static str) -> Result<T>;
}

impl<T> StepContext<T> for Result<T> {
    fn step(self, step: &'static str) -> Result<T> {
        self.map_err(|e| Error::Reconcile {
            step,
            source: Box::new(e),
        })
    }
}
