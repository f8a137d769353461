use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AgentError, ToolError};

use super::ToolDefinition;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputerEnvironment {
    Mac,
    Windows,
    Ubuntu,
    Browser,
}

impl ComputerEnvironment {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mac => "mac",
            Self::Windows => "windows",
            Self::Ubuntu => "ubuntu",
            Self::Browser => "browser",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

fn left_button() -> String {
    "left".to_string()
}

/// A single UI action requested by the model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ComputerAction {
    Click {
        x: i64,
        y: i64,
        #[serde(default = "left_button")]
        button: String,
    },
    DoubleClick {
        x: i64,
        y: i64,
    },
    Scroll {
        x: i64,
        y: i64,
        scroll_x: i64,
        scroll_y: i64,
    },
    Type {
        text: String,
    },
    Wait,
    Move {
        x: i64,
        y: i64,
    },
    Keypress {
        keys: Vec<String>,
    },
    Drag {
        path: Vec<Point>,
    },
    Screenshot,
}

/// A screen the model can drive.
#[async_trait]
pub trait Computer: Send + Sync {
    fn environment(&self) -> ComputerEnvironment;

    /// Display `(width, height)` in pixels.
    fn dimensions(&self) -> (u32, u32);

    async fn perform(&self, action: &ComputerAction) -> Result<(), ToolError>;

    /// Base64-encoded PNG of the current screen.
    async fn screenshot(&self) -> Result<String, ToolError>;
}

#[derive(Clone)]
pub struct ComputerTool {
    computer: Arc<dyn Computer>,
}

impl std::fmt::Debug for ComputerTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputerTool")
            .field("environment", &self.computer.environment())
            .field("dimensions", &self.computer.dimensions())
            .finish()
    }
}

impl ComputerTool {
    pub const NAME: &'static str = "computer_use_preview";

    pub fn new(computer: impl Computer + 'static) -> Self {
        Self {
            computer: Arc::new(computer),
        }
    }

    pub fn from_arc(computer: Arc<dyn Computer>) -> Self {
        Self { computer }
    }

    pub fn definition(&self) -> ToolDefinition {
        let (display_width, display_height) = self.computer.dimensions();
        ToolDefinition::Computer {
            environment: self.computer.environment(),
            display_width,
            display_height,
        }
    }

    /// Performs the requested action and returns a `data:` URL of the
    /// screenshot taken afterwards.
    pub async fn execute(&self, action: &Value) -> Result<String, AgentError> {
        let action = serde_json::from_value::<ComputerAction>(action.clone()).map_err(|err| {
            AgentError::model_behavior(format!("invalid computer action: {err}"))
        })?;

        if action != ComputerAction::Screenshot {
            self.computer.perform(&action).await?;
        }
        let screenshot = self.computer.screenshot().await?;
        Ok(format!("data:image/png;base64,{screenshot}"))
    }
}
