pub mod clock;
pub mod error;
pub mod facade;
pub mod lifecycle;
pub mod locks;
pub mod metrics_reader;
pub mod repository;
pub mod results;
pub mod state_machine;
pub mod status;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ExperimentError, Result};
pub use facade::ExperimentFacade;
pub use lifecycle::ExperimentLifecycleService;
pub use metrics_reader::{HttpMetricsReader, MetricsError, MetricsReader, NoOpMetricsReader};
pub use repository::{ExperimentRepository, InMemoryRepository, RepositoryError};
pub use results::ResultsAggregator;
pub use state_machine::TransitionConflict;
pub use status::StatusAggregator;
