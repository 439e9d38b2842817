use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use intake_core::{FailureStage, RunSummary};
use tokio::fs;

/// Writes `summary.json` and `brief.md` under `<dir>/<run_id>/` and returns that directory.
pub async fn write_run_report(dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;

    fs::write(run_dir.join("brief.md"), render_brief(summary))
        .await
        .context("writing brief.md")?;

    Ok(run_dir)
}

pub fn render_brief(summary: &RunSummary) -> String {
    let failures = if summary.failures.is_empty() {
        "- none".to_string()
    } else {
        summary
            .failures
            .iter()
            .map(|f| {
                let stage = match f.stage {
                    FailureStage::Upload => "upload",
                    FailureStage::Persist => "persist",
                };
                format!("- `{}` ({stage}): {}", f.sku, f.error)
            })
            .collect::<Vec<_>>()
            .join("\n")
    };

    format!(
        "# Catalog Intake Run\n\n- Run ID: `{}`\n- Owner: `{}`\n- Started: {}\n- Finished: {}\n- Outcome: {}\n- Succeeded: {}\n- Failed: {}\n- Skipped duplicates: {}\n- Unmatched images: {}\n- Rejected feed rows: {}\n\n## Needs Retry\n{}\n",
        summary.run_id,
        summary.owner_id,
        summary.started_at,
        summary.finished_at,
        summary.phase,
        summary.succeeded,
        summary.failed,
        summary.skipped_duplicates,
        summary.unmatched,
        summary.rejected_rows,
        failures,
    )
}
