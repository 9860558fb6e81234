pub mod pg_tools;
pub mod pipe;

pub use pg_tools::{PgTool, dump_args, resolve_tool, restore_args};
pub use pipe::{CommandSpec, PipeEvent, PipeOutcome, pipe_from_command, pipe_to_command};
