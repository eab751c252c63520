pub mod selection;
pub mod standard_job_executor;
pub mod work_unit;
pub mod work_unit_executor;

pub use standard_job_executor::{JobOutcome, StandardJobExecutor};
pub use work_unit_executor::{WorkUnitExecutor, WorkUnitOutcome};
