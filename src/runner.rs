//! Output formatting and the CLI exit-code contract.
//!
//! The core returns a [`CommandOutcome`]; the shell formats it. Exit codes:
//! `0 success`, `1 general`, `2 invalid-args`, `3 not-found`,
//! `4 validation`, `5 permission`.

use std::str::FromStr;

use anyhow::{bail, Result};
use serde::Serialize;

use stoneforge_core::StoneforgeError;

/// Exit code for success.
pub const EXIT_SUCCESS: i32 = 0;
/// Exit code for general failures.
pub const EXIT_GENERAL: i32 = 1;
/// Exit code for invalid arguments.
pub const EXIT_INVALID_ARGS: i32 = 2;

// ---------------------------------------------------------------------------
// OutputFormat
// ---------------------------------------------------------------------------

/// Output mode for structured data.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-friendly text (default).
    #[default]
    Human,
    /// Machine-parseable JSON.
    Json,
    /// Ids only, one per line.
    Quiet,
}

impl FromStr for OutputFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "human" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            "quiet" => Ok(Self::Quiet),
            _ => bail!("Invalid format '{s}'. Use: human, json, or quiet"),
        }
    }
}

impl OutputFormat {
    /// Resolve the format from the `--json` / `--quiet` flags.
    #[must_use]
    pub const fn resolve(json: bool, quiet: bool) -> Self {
        if json {
            Self::Json
        } else if quiet {
            Self::Quiet
        } else {
            Self::Human
        }
    }

    /// Serialize `data` for JSON mode.
    ///
    /// # Errors
    /// Serialization failures only.
    pub fn serialize<T: Serialize>(self, data: &T) -> Result<String> {
        match self {
            Self::Json => serde_json::to_string_pretty(data)
                .map_err(|e| anyhow::anyhow!("JSON serialization failed: {e}")),
            Self::Human | Self::Quiet => {
                bail!("{self:?} format should not use serialize()")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// CommandOutcome
// ---------------------------------------------------------------------------

/// What a command produced, before the shell formats it.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutcome {
    /// Exit code per the taxonomy.
    pub exit_code: i32,
    /// Structured payload for `--json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Human-facing summary.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Error description, on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    /// A success with a payload and a message.
    #[must_use]
    pub fn success<T: Serialize>(data: &T, message: impl Into<String>) -> Self {
        Self {
            exit_code: EXIT_SUCCESS,
            data: serde_json::to_value(data).ok(),
            message: Some(message.into()),
            error: None,
        }
    }

    /// A failure derived from any error, mapping typed core failures onto
    /// their contract exit codes and everything else onto `1`.
    #[must_use]
    pub fn failure(error: &anyhow::Error) -> Self {
        let exit_code = error
            .chain()
            .find_map(|cause| cause.downcast_ref::<StoneforgeError>())
            .map_or(EXIT_GENERAL, StoneforgeError::exit_code);
        Self {
            exit_code,
            data: None,
            message: None,
            error: Some(format!("{error:#}")),
        }
    }

    /// Render to stdout/stderr per the format; returns the exit code.
    #[must_use]
    pub fn render(&self, format: OutputFormat, quiet_ids: &[String]) -> i32 {
        match format {
            OutputFormat::Json => match format.serialize(self) {
                Ok(json) => println!("{json}"),
                Err(e) => eprintln!("error: {e}"),
            },
            OutputFormat::Quiet => {
                for id in quiet_ids {
                    println!("{id}");
                }
                if let Some(error) = &self.error {
                    eprintln!("error: {error}");
                }
            }
            OutputFormat::Human => {
                if let Some(message) = &self.message {
                    println!("{message}");
                }
                if let Some(error) = &self.error {
                    eprintln!("error: {error}");
                }
            }
        }
        self.exit_code
    }
}
