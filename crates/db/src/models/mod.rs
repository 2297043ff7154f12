pub mod conversation_result;
pub mod dev_environment;
pub mod execution_log;
pub mod git_credential;
pub mod project;
pub mod system_config;
pub mod task;
pub mod task_conversation;
