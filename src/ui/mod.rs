//! Terminal output for the CLI
//!
//! Uses `cliclack` for styled steps and spinners, falling back to plain
//! lines when the stream is not a terminal or `CI` is set.

mod context;
mod output;
mod progress;

pub use context::UiContext;
pub use output::{
    intro, key_value, key_value_status, step_error_detail, step_info, step_ok, step_ok_detail,
    step_warn, step_warn_hint,
};
pub use progress::TaskSpinner;
