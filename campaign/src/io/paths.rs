//! Canonical file layout of a campaign directory.

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow};

pub const RUN_STATE_FILE: &str = "campaign.run.state.json";
pub const PLAN_FILE: &str = "campaign.plan.json";
pub const PROGRESS_FILE: &str = "campaign.progress.jsonl";
pub const LOCK_DIR: &str = "campaign.lock";
pub const LOCK_OWNER_FILE: &str = "owner.json";

/// All canonical paths within `<output_root>/<campaign_id>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CampaignPaths {
    pub campaign_dir: PathBuf,
    pub run_state_path: PathBuf,
    pub plan_path: PathBuf,
    pub progress_path: PathBuf,
    pub lock_path: PathBuf,
}

impl CampaignPaths {
    pub fn new(output_root: &Path, campaign_id: &str) -> Self {
        Self::for_dir(output_root.join(campaign_id))
    }

    /// Paths for an existing campaign directory (used by `report`/`summary`).
    pub fn for_dir(campaign_dir: impl Into<PathBuf>) -> Self {
        let campaign_dir = campaign_dir.into();
        Self {
            run_state_path: campaign_dir.join(RUN_STATE_FILE),
            plan_path: campaign_dir.join(PLAN_FILE),
            progress_path: campaign_dir.join(PROGRESS_FILE),
            lock_path: campaign_dir.join(LOCK_DIR),
            campaign_dir,
        }
    }
}

/// Validate that an id is safe to use as a single path segment.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("id must not be '.' or '..'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_stable() {
        let paths = CampaignPaths::new(Path::new("/out"), "nightly");
        assert_eq!(paths.campaign_dir, PathBuf::from("/out/nightly"));
        assert!(paths.run_state_path.ends_with("nightly/campaign.run.state.json"));
        assert!(paths.plan_path.ends_with("campaign.plan.json"));
        assert!(paths.progress_path.ends_with("campaign.progress.jsonl"));
        assert!(paths.lock_path.ends_with("campaign.lock"));
    }

    #[test]
    fn validate_id_rejects_path_separators() {
        let err = validate_id("bad/id").unwrap_err();
        assert!(err.to_string().contains("[A-Za-z0-9._-]"));
        assert!(validate_id("..").is_err());
        assert!(validate_id("nightly-2026.01_a").is_ok());
    }
}
