//! Editor shell state: theme, active tool, file name and the three docked panels.
//!
//! Everything here is a plain value owned by the caller. The canvas engine never
//! reads it; the shell forwards drawing through engine commands instead.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Theme {
    #[default]
    Dark,
    Light,
}

impl Theme {
    pub fn toggled(self) -> Self {
        match self {
            Self::Dark => Self::Light,
            Self::Light => Self::Dark,
        }
    }
}

/// Identifier of the tool that turns pointer input into pixel writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tool(String);

impl Tool {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PanelKind {
    #[serde(rename = "toolsPanel")]
    Tools,
    #[serde(rename = "layersPanel")]
    Layers,
    #[serde(rename = "footerPanel")]
    Footer,
}

impl PanelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tools => "toolsPanel",
            Self::Layers => "layersPanel",
            Self::Footer => "footerPanel",
        }
    }

    /// The side panel that gets pushed away when this one takes a side.
    fn opposite(self) -> Option<Self> {
        match self {
            Self::Tools => Some(Self::Layers),
            Self::Layers => Some(Self::Tools),
            Self::Footer => None,
        }
    }
}

impl fmt::Display for PanelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PanelKind {
    type Err = EditorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "toolsPanel" => Ok(Self::Tools),
            "layersPanel" => Ok(Self::Layers),
            "footerPanel" => Ok(Self::Footer),
            _ => Err(EditorError::UnknownPanel(value.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PanelPosition {
    Left,
    Right,
    Top,
}

impl PanelPosition {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Top => "top",
        }
    }
}

impl fmt::Display for PanelPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PanelPosition {
    type Err = EditorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "left" => Ok(Self::Left),
            "right" => Ok(Self::Right),
            "top" => Ok(Self::Top),
            _ => Err(EditorError::UnknownPosition(value.to_owned())),
        }
    }
}

/// Visibility and dock position of one panel. The footer has no position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PanelState {
    pub status: bool,
    pub position: Option<PanelPosition>,
}

impl PanelState {
    pub fn docked(position: PanelPosition) -> Self {
        Self {
            status: true,
            position: Some(position),
        }
    }

    pub fn undocked() -> Self {
        Self {
            status: true,
            position: None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EditorError {
    #[error(
        "panel rearrangement is not possible: position {position:?} or panel {panel:?} is not valid"
    )]
    InvalidPanelOrPositionArgument { position: String, panel: String },
    #[error("unknown panel {0:?}")]
    UnknownPanel(String),
    #[error("unknown panel position {0:?}")]
    UnknownPosition(String),
}

/// Starting state of the shell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorConfig {
    pub theme: Theme,
    pub file_name: String,
    pub tools_panel: PanelState,
    pub layers_panel: PanelState,
    pub footer_panel: PanelState,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            theme: Theme::default(),
            file_name: "Untitled".to_owned(),
            tools_panel: PanelState::docked(PanelPosition::Left),
            layers_panel: PanelState::docked(PanelPosition::Right),
            footer_panel: PanelState::undocked(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditorState {
    theme: Theme,
    current_tool: Option<Tool>,
    file_name: String,
    tools_panel: PanelState,
    layers_panel: PanelState,
    footer_panel: PanelState,
    canvas_bound: bool,
}

impl Default for EditorState {
    fn default() -> Self {
        Self::new(EditorConfig::default())
    }
}

impl EditorState {
    pub fn new(config: EditorConfig) -> Self {
        Self {
            theme: config.theme,
            current_tool: None,
            file_name: config.file_name,
            tools_panel: config.tools_panel,
            layers_panel: config.layers_panel,
            footer_panel: config.footer_panel,
            canvas_bound: false,
        }
    }

    pub fn theme(&self) -> Theme {
        self.theme
    }

    pub fn current_tool(&self) -> Option<&Tool> {
        self.current_tool.as_ref()
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn canvas_bound(&self) -> bool {
        self.canvas_bound
    }

    pub fn panel(&self, kind: PanelKind) -> PanelState {
        match kind {
            PanelKind::Tools => self.tools_panel,
            PanelKind::Layers => self.layers_panel,
            PanelKind::Footer => self.footer_panel,
        }
    }

    fn panel_mut(&mut self, kind: PanelKind) -> &mut PanelState {
        match kind {
            PanelKind::Tools => &mut self.tools_panel,
            PanelKind::Layers => &mut self.layers_panel,
            PanelKind::Footer => &mut self.footer_panel,
        }
    }

    pub fn toggle_theme(&mut self) -> Theme {
        self.theme = self.theme.toggled();
        self.theme
    }

    pub fn change_tool(&mut self, tool: Tool) {
        tracing::debug!(tool = tool.name(), "editor tool changed");
        self.current_tool = Some(tool);
    }

    pub fn update_file_name(&mut self, file_name: impl Into<String>) {
        self.file_name = file_name.into();
    }

    /// Records that the engine has a surface to draw on.
    pub fn mark_canvas_bound(&mut self) {
        if !self.canvas_bound {
            tracing::debug!("editor canvas bound");
        }
        self.canvas_bound = true;
    }

    /// Flips the visibility of a panel named by its shell identifier. Unknown
    /// names are ignored and return `None`.
    pub fn toggle_panel_status(&mut self, panel: &str) -> Option<bool> {
        let kind = panel.parse::<PanelKind>().ok()?;
        let state = self.panel_mut(kind);
        state.status = !state.status;
        Some(state.status)
    }

    /// Moves the tools or layers panel. Taking a side pushes the other side
    /// panel to the opposite side, unless that panel sits at the top.
    pub fn update_panel_position(
        &mut self,
        new_position: &str,
        panel: &str,
    ) -> Result<(), EditorError> {
        let invalid = || EditorError::InvalidPanelOrPositionArgument {
            position: new_position.to_owned(),
            panel: panel.to_owned(),
        };
        let position = new_position
            .parse::<PanelPosition>()
            .map_err(|_| invalid())?;
        let kind = panel.parse::<PanelKind>().map_err(|_| invalid())?;
        let opposite = kind.opposite().ok_or_else(invalid)?;

        if self.panel(kind).position == Some(position) {
            return Ok(());
        }

        self.panel_mut(kind).position = Some(position);
        let pushed_to = match position {
            PanelPosition::Left => PanelPosition::Right,
            PanelPosition::Right => PanelPosition::Left,
            PanelPosition::Top => return Ok(()),
        };
        let opposite_state = self.panel_mut(opposite);
        if opposite_state.position != Some(PanelPosition::Top) {
            opposite_state.position = Some(pushed_to);
        }
        tracing::debug!(
            panel = kind.as_str(),
            position = position.as_str(),
            "editor panel moved"
        );
        Ok(())
    }
}
