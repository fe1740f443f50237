//! Stage dispatcher
//!
//! Every stage invocation goes through [`Dispatcher::dispatch`], which owns
//! the idempotency guard, the status transitions and the routing table.
//! Handlers only do the stage's own work.

mod context;
mod dispatcher;
mod handler;
mod invocation;
mod routing;

pub use context::{Ask, StageContext, Structured};
pub use dispatcher::Dispatcher;
pub use handler::{StageHandler, StageOutcome};
pub use invocation::{Invocation, StageInvoker, StageResponse};
pub use routing::{RouteInput, route};
