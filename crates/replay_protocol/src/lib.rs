use std::io::{BufRead, Write};

use model::PixelBuffer;
use protocol::CanvasCommand;
use serde::{Deserialize, Serialize};

pub const REPLAY_SCHEMA_VERSION: u16 = 1;

pub type StepId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReplayAction {
    /// Bind a fresh render surface to the engine.
    InitCanvas,
    Command { command: CanvasCommand },
    /// Drain background work and compare the engine against this digest.
    ExpectDigest { digest: StateDigest },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayStep {
    pub schema_version: u16,
    pub step_id: StepId,
    pub action: ReplayAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_wall_time_micros: Option<u64>,
}

impl ReplayStep {
    pub fn new(step_id: StepId, action: ReplayAction) -> Self {
        Self {
            schema_version: REPLAY_SCHEMA_VERSION,
            step_id,
            action,
            debug_wall_time_micros: None,
        }
    }

    pub fn command(step_id: StepId, command: CanvasCommand) -> Self {
        Self::new(step_id, ReplayAction::Command { command })
    }
}

/// Observable engine state reduced to a few comparable fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDigest {
    pub layer_count: usize,
    pub current_layer: usize,
    pub width: u32,
    pub height: u32,
    pub opaque_pixel_count: usize,
    pub composite_hash: String,
}

impl StateDigest {
    /// Digest of an engine with no bound canvas.
    pub fn unbound(layer_count: usize, current_layer: usize) -> Self {
        Self {
            layer_count,
            current_layer,
            width: 0,
            height: 0,
            opaque_pixel_count: 0,
            composite_hash: fnv1a64_digest(&[]),
        }
    }

    pub fn capture(layer_count: usize, current_layer: usize, composite: &PixelBuffer) -> Self {
        Self {
            layer_count,
            current_layer,
            width: composite.width(),
            height: composite.height(),
            opaque_pixel_count: composite.opaque_pixel_count(),
            composite_hash: fnv1a64_digest(composite.as_bytes()),
        }
    }
}

const FNV1A64_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV1A64_PRIME: u64 = 0x0000_0100_0000_01b3;

pub fn fnv1a64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV1A64_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV1A64_PRIME)
    })
}

pub fn fnv1a64_digest(bytes: &[u8]) -> String {
    format!("fnv1a64:{:016x}", fnv1a64(bytes))
}

pub fn write_jsonl_step_line(writer: &mut dyn Write, step: &ReplayStep) -> Result<(), std::io::Error> {
    serde_json::to_writer(&mut *writer, step).map_err(|error| {
        std::io::Error::other(format!("serialize replay step as JSON failed: {error}"))
    })?;
    writer.write_all(b"\n")
}

pub fn read_jsonl_steps(reader: &mut dyn BufRead) -> Result<Vec<ReplayStep>, std::io::Error> {
    let mut steps = Vec::new();
    let mut line_buffer = String::new();
    let mut line_number = 0usize;
    loop {
        line_buffer.clear();
        let bytes = reader.read_line(&mut line_buffer)?;
        if bytes == 0 {
            break;
        }
        line_number += 1;
        let line = line_buffer.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let step = serde_json::from_str::<ReplayStep>(line).map_err(|error| {
            std::io::Error::other(format!(
                "parse replay step JSON at line {line_number} failed: {error}"
            ))
        })?;
        steps.push(step);
    }
    Ok(steps)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    EmptyScript,
    UnsupportedSchemaVersion {
        step_id: StepId,
        schema_version: u16,
    },
    StepIdNotStrictlyIncreasing {
        previous: StepId,
        current: StepId,
    },
    DrawBeforeInit {
        step_id: StepId,
    },
}

/// Structural checks that do not need an engine. Layer indices are left to the
/// engine, which reports them per command.
pub fn validate_script(steps: &[ReplayStep]) -> Result<(), ValidationError> {
    if steps.is_empty() {
        return Err(ValidationError::EmptyScript);
    }

    let mut previous_step_id: Option<StepId> = None;
    let mut canvas_bound = false;
    for step in steps {
        if step.schema_version != REPLAY_SCHEMA_VERSION {
            return Err(ValidationError::UnsupportedSchemaVersion {
                step_id: step.step_id,
                schema_version: step.schema_version,
            });
        }
        if let Some(previous) = previous_step_id {
            if step.step_id <= previous {
                return Err(ValidationError::StepIdNotStrictlyIncreasing {
                    previous,
                    current: step.step_id,
                });
            }
        }
        previous_step_id = Some(step.step_id);

        match &step.action {
            ReplayAction::InitCanvas => canvas_bound = true,
            ReplayAction::Command { command } => match command {
                CanvasCommand::AddLayer
                | CanvasCommand::Draw(_)
                | CanvasCommand::DrawBatch { .. }
                    if !canvas_bound =>
                {
                    return Err(ValidationError::DrawBeforeInit {
                        step_id: step.step_id,
                    });
                }
                CanvasCommand::ResetState => canvas_bound = false,
                _ => {}
            },
            ReplayAction::ExpectDigest { .. } => {}
        }
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareError {
    DigestMismatch {
        field: &'static str,
        expected: String,
        actual: String,
    },
}

pub fn compare_digests(expected: &StateDigest, actual: &StateDigest) -> Result<(), CompareError> {
    let fields = [
        (
            "layer_count",
            expected.layer_count.to_string(),
            actual.layer_count.to_string(),
        ),
        (
            "current_layer",
            expected.current_layer.to_string(),
            actual.current_layer.to_string(),
        ),
        ("width", expected.width.to_string(), actual.width.to_string()),
        ("height", expected.height.to_string(), actual.height.to_string()),
        (
            "opaque_pixel_count",
            expected.opaque_pixel_count.to_string(),
            actual.opaque_pixel_count.to_string(),
        ),
        (
            "composite_hash",
            expected.composite_hash.clone(),
            actual.composite_hash.clone(),
        ),
    ];
    for (field, expected, actual) in fields {
        if expected != actual {
            return Err(CompareError::DigestMismatch {
                field,
                expected,
                actual,
            });
        }
    }
    Ok(())
}
