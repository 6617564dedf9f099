//! Layered key/value context used by hooks to override run parameters.
//!
//! Reads walk from the top frame downward, writes land on the top frame.
//! Hooks push a frame in one lifecycle callback and pop it in the matching
//! unwind callback, so the stack depth returns to one after every run.

use std::collections::HashMap;

use crate::error::{Result, WorkerError};

pub const WORKING_DIR_KEY: &str = "working_dir";
pub const LOG_DIR_KEY: &str = "log_dir";
pub const LOG_FILE_KEY: &str = "log_file";
pub const VOLUMES_KEY: &str = "volumes";

/// Container-side view of a path key.
pub fn docker_key(key: &str) -> String {
    format!("{key}:docker")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextValue {
    Str(String),
    List(Vec<String>),
}

impl ContextValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::Str(s) => Some(s),
            ContextValue::List(_) => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            ContextValue::List(l) => Some(l),
            ContextValue::Str(_) => None,
        }
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::Str(s)
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::Str(s.to_string())
    }
}

impl From<Vec<String>> for ContextValue {
    fn from(l: Vec<String>) -> Self {
        ContextValue::List(l)
    }
}

pub type Frame = HashMap<String, ContextValue>;

#[derive(Debug, Clone)]
pub struct Context {
    frames: Vec<Frame>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    /// A context holding only the root frame.
    pub fn new() -> Self {
        Self {
            frames: vec![Frame::new()],
        }
    }

    /// Push an empty frame and return it for population.
    pub fn enter(&mut self) -> &mut Frame {
        self.frames.push(Frame::new());
        self.top_mut()
    }

    /// Pop the top frame. The root frame cannot be popped.
    pub fn exit(&mut self) -> Result<()> {
        if self.frames.len() <= 1 {
            return Err(WorkerError::ContextRootExit);
        }
        self.frames.pop();
        Ok(())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.top_mut().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.frames.iter().rev().find_map(|frame| frame.get(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(ContextValue::as_str)
    }

    /// Number of frames including the root.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    fn top_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }
}
