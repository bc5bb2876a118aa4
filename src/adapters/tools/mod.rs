pub mod reminder;

pub use reminder::{parse_when, spawn_reminder_watcher, CreateReminderTool, Reminder, ReminderStore};

use crate::config::ToolsConfig;
use crate::domain::registry::ToolRegistry;
use crate::error::Result;
use std::sync::Arc;

/// Registers the built-in tools enabled in `config`.
pub fn register_builtin(registry: &mut ToolRegistry, config: &ToolsConfig, reminders: &Arc<ReminderStore>) -> Result<()> {
    if config.reminders {
        registry.register(Arc::new(CreateReminderTool::new(Arc::clone(reminders))))?;
    }
    Ok(())
}
