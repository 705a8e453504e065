pub mod dump_command;
pub mod exit_result;
pub mod options;
pub mod record_command;
pub mod replay_command;
