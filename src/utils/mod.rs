pub mod permissions;
pub mod shell;
pub mod suggest;
pub mod tool_errors;
pub mod user_paths;
