//! Domain model (ids, task records, route policy, errors).

pub mod errors;
pub mod ids;
pub mod policy;
pub mod task;

pub use self::errors::{AdmissionRejection, HandlerError, StoreError, TurnstileError};
pub use self::ids::{ParseTaskIdError, TaskId};
pub use self::policy::{HttpMethod, RoutePolicy};
pub use self::task::{TaskLookup, TaskRecord, TaskStatus};
