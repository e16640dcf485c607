//! Domain model: ids, status machine, task records, updates, errors.

pub mod errors;
pub mod ids;
pub mod record;
pub mod status;
pub mod update;

pub use self::errors::{ErrorClass, HandlerError, TaskError};
pub use self::ids::{ParseTaskIdError, TaskId};
pub use self::record::{TaskKind, TaskRecord};
pub use self::status::{ParseStatusError, TaskStatus};
pub use self::update::{Precondition, TaskUpdate};
