//! Step model and plan execution ledger.

mod ledger;
mod step;

pub use ledger::{HistoryRow, Plan, PlanError, PlanStore, truncate};
pub use step::{RunMethod, ShellRunner, Step, StepError, StepParseError, StepRunner};
