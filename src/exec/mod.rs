pub mod shell;

pub use shell::{execute_with_input, ExecResult};
