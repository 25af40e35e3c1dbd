//! Worker-side command registry.

use std::collections::HashMap;

/// Where a namespaced command id is bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBinding {
    pub extension_id: String,
    /// Handler key understood by the owning module.
    pub handler: String,
}

/// Namespaced command id -> handler binding. Each id has exactly one owner.
#[derive(Debug, Default)]
pub struct CommandRegistry {
    commands: HashMap<String, CommandBinding>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `command_id`, replacing any previous binding.
    pub fn bind(&mut self, command_id: impl Into<String>, binding: CommandBinding) {
        let command_id = command_id.into();
        if let Some(previous) = self.commands.insert(command_id.clone(), binding) {
            tracing::debug!(command_id, owner = %previous.extension_id, "Replaced command binding");
        }
    }

    pub fn get(&self, command_id: &str) -> Option<&CommandBinding> {
        self.commands.get(command_id)
    }

    /// Remove `command_id` if it is owned by `extension_id`.
    pub fn unbind(&mut self, command_id: &str, extension_id: &str) -> bool {
        match self.commands.get(command_id) {
            Some(binding) if binding.extension_id == extension_id => {
                self.commands.remove(command_id);
                true
            }
            _ => false,
        }
    }

    /// Remove every command owned by `extension_id`.
    pub fn unbind_owner(&mut self, extension_id: &str) -> usize {
        let before = self.commands.len();
        self.commands
            .retain(|_, binding| binding.extension_id != extension_id);
        before - self.commands.len()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
