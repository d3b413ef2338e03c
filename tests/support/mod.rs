pub mod fake_shell;
pub mod helpers;
