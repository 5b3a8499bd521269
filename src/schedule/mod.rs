//! Feed refresh scheduling for feedmon.

pub mod emitter;

pub use emitter::{ScheduleEmitter, TickReport};
