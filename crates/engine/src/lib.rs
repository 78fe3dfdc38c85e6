pub mod archive;
pub mod clock;
pub mod destination;
pub mod orchestrator;
pub mod runtime;
pub mod scheduler;

pub use archive::{Archiver, Artifact};
pub use clock::{Clock, ManualClock, SystemClock};
pub use destination::{Destination, DestinationAdapter};
pub use orchestrator::{JobRunSummary, Orchestrator};
pub use runtime::{ContainerRuntime, DockerRuntime, ExecOutput, RuntimeError};
pub use scheduler::{Scheduler, SchedulerHandle, TickReport};
