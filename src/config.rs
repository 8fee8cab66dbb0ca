//! Project configuration read from `cadence.toml` at the checkout root.
//!
//! The file is versioned with the repository, so every checkout of the same
//! project sees the same pipeline wiring:
//!
//! ```toml
//! [pipeline]
//! handler_cmd = "scripts/phase.sh"
//! approval_cmd = "scripts/approved.sh"
//!
//! [branches]
//! release_pattern = "^release/"
//! trunk = ["main", "master"]
//! ```
//!
//! Everything is optional; defaults keep `cadence status` useful in a
//! repository with no configuration at all.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::handlers::{CommandApprovals, CommandHandler};
use crate::pipeline::BranchRules;

/// Name of the configuration file at the checkout root.
pub const CONFIG_FILE: &str = "cadence.toml";

/// Pipeline collaborator wiring.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Executable invoked with the phase name; exit 0 = phase succeeded.
    #[serde(default)]
    pub handler_cmd: Option<String>,
    /// Executable invoked with a review reference; exit 0 = approved.
    #[serde(default)]
    pub approval_cmd: Option<String>,
}

/// Branch classification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchesConfig {
    /// Regex a release-lineage branch matches.
    #[serde(default = "default_release_pattern")]
    pub release_pattern: String,
    /// Persistent trunk branches, never released directly.
    #[serde(default = "default_trunk")]
    pub trunk: Vec<String>,
}

fn default_release_pattern() -> String {
    "^release/".to_string()
}

fn default_trunk() -> Vec<String> {
    vec!["main".to_string(), "master".to_string(), "develop".to_string()]
}

impl Default for BranchesConfig {
    fn default() -> Self {
        Self {
            release_pattern: default_release_pattern(),
            trunk: default_trunk(),
        }
    }
}

/// The full `cadence.toml` contents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceToml {
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub branches: BranchesConfig,
}

impl CadenceToml {
    /// Load the configuration from the checkout root, falling back to
    /// defaults when no file exists. A present-but-invalid file is an
    /// error, not a silent fallback.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Compile the branch classification rules.
    pub fn branch_rules(&self) -> Result<BranchRules> {
        let pattern = Regex::new(&self.branches.release_pattern).with_context(|| {
            format!(
                "invalid branches.release_pattern '{}'",
                self.branches.release_pattern
            )
        })?;
        Ok(BranchRules::new(pattern, self.branches.trunk.clone()))
    }

    /// The configured phase handler, if any.
    pub fn handler(&self) -> Option<CommandHandler> {
        self.pipeline.handler_cmd.as_deref().map(CommandHandler::new)
    }

    /// The configured approval source, if any.
    pub fn approvals(&self) -> Option<CommandApprovals> {
        self.pipeline
            .approval_cmd
            .as_deref()
            .map(CommandApprovals::new)
    }
}
