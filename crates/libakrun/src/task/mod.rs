//! Task lifecycle: handler state machine, snapshots, and the job-side pieces
//! (script rendering, batch scheduler adapters, output parsers).

mod handler;
pub mod layout;
pub mod parser;
pub mod scheduler;
pub mod script;
pub mod snapshot;

pub use handler::{HandlerKind, MemberResult, StepContext, StepOutcome, TaskHandler, TaskParams};
pub use layout::{TaskLayout, time_stamp};
pub use parser::{OutputParser, ParsedRun, ParserRegistry};
