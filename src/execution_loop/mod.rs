pub mod cancel;
pub mod controller;
pub mod error_recovery;
pub mod runner;
pub mod session;

pub use cancel::CancellationToken;
pub use controller::FeedbackLoop;
pub use error_recovery::{closest_names, ErrorRecovery};
pub use runner::SessionRunner;
pub use session::{best_effort, Attempt, Session, SessionOutcome, SessionReport, SessionStatus};
