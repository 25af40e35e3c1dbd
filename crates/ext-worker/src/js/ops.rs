//! Ops exposed to extension JavaScript.
//!
//! Every op takes the acting extension's id as an explicit argument; the
//! script-side context object closes over it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use breadcrumb_ext_protocol::{InputModalOptions, LogLevel, TerminalOptions, WorkerMessage};
use deno_core::error::{AnyError, generic_error};
use deno_core::{OpState, op2};

use crate::loader::qualify_command;
use crate::services::ServiceBroker;

/// Registration windows, one per extension currently inside `activate()`.
#[derive(Default)]
pub struct RegisteredCommands {
    open: HashMap<String, Vec<String>>,
}

impl RegisteredCommands {
    pub fn open(&mut self, extension_id: &str) {
        self.open.insert(extension_id.to_string(), Vec::new());
    }

    pub fn close(&mut self, extension_id: &str) -> Vec<String> {
        self.open.remove(extension_id).unwrap_or_default()
    }
}

#[op2(fast)]
pub fn op_breadcrumb_log(
    state: &mut OpState,
    #[string] extension_id: &str,
    #[string] level: &str,
    #[string] message: &str,
) {
    let message = if extension_id.is_empty() {
        message.to_string()
    } else {
        format!("[{extension_id}] {message}")
    };
    state.borrow::<ServiceBroker>().send(WorkerMessage::Log {
        level: LogLevel::parse(level),
        message,
    });
}

/// Record a command registration and return its namespaced id.
#[op2]
#[string]
pub fn op_breadcrumb_register_command(
    state: &mut OpState,
    #[string] extension_id: String,
    #[string] command_id: String,
) -> Result<String, AnyError> {
    if command_id.is_empty() {
        return Err(generic_error("Command id must not be empty"));
    }
    let qualified = qualify_command(&extension_id, &command_id);
    let Some(window) = state
        .borrow_mut::<RegisteredCommands>()
        .open
        .get_mut(&extension_id)
    else {
        return Err(generic_error(format!(
            "Cannot register {qualified} outside of activate()"
        )));
    };
    window.push(command_id);
    Ok(qualified)
}

#[op2]
pub fn op_breadcrumb_state_set(
    state: &mut OpState,
    #[string] extension_id: String,
    #[string] key: String,
    #[serde] value: serde_json::Value,
) {
    state.borrow::<ServiceBroker>().send(WorkerMessage::StateSet {
        id: extension_id,
        key,
        value,
    });
}

#[op2(async)]
#[string]
pub async fn op_breadcrumb_create_terminal(
    state: Rc<RefCell<OpState>>,
    #[string] extension_id: String,
    #[serde] options: TerminalOptions,
) -> Result<String, AnyError> {
    let broker = state.borrow().borrow::<ServiceBroker>().clone();
    broker
        .create_terminal(&extension_id, options)
        .await
        .map_err(|e| generic_error(e.to_string()))
}

#[op2(async)]
#[serde]
pub async fn op_breadcrumb_show_input_modal(
    state: Rc<RefCell<OpState>>,
    #[string] extension_id: String,
    #[serde] options: InputModalOptions,
) -> Result<Option<String>, AnyError> {
    let broker = state.borrow().borrow::<ServiceBroker>().clone();
    broker
        .show_input_modal(&extension_id, options)
        .await
        .map_err(|e| generic_error(e.to_string()))
}

deno_core::extension!(
    breadcrumb_ext,
    ops = [
        op_breadcrumb_log,
        op_breadcrumb_register_command,
        op_breadcrumb_state_set,
        op_breadcrumb_create_terminal,
        op_breadcrumb_show_input_modal,
    ],
    esm_entry_point = "ext:breadcrumb_ext/bootstrap.js",
    esm = [dir "src/js", "bootstrap.js"],
);
