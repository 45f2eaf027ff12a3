//! File selection prompts for `select_files` requests.

use async_trait::async_trait;
use dialoguer::{theme::ColorfulTheme, MultiSelect};
use shared_types::SelectFilesRequest;

#[async_trait]
pub trait SelectionPrompt: Send + Sync {
    /// Returns the chosen subset of `request.files`. Empty means install
    /// nothing.
    async fn choose(&self, request: &SelectFilesRequest) -> Vec<String>;
}

/// Accepts every offered file. Used when the shell runs non-interactively.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelectAll;

#[async_trait]
impl SelectionPrompt for SelectAll {
    async fn choose(&self, request: &SelectFilesRequest) -> Vec<String> {
        request.files.clone()
    }
}

/// Multi-select on the controlling terminal, everything pre-checked.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl SelectionPrompt for TerminalPrompt {
    async fn choose(&self, request: &SelectFilesRequest) -> Vec<String> {
        if request.files.is_empty() {
            return Vec::new();
        }

        let request = request.clone();
        let files = request.files.clone();
        let picked = tokio::task::spawn_blocking(move || {
            let defaults = vec![true; request.files.len()];
            MultiSelect::with_theme(&ColorfulTheme::default())
                .with_prompt(format!("Install files from {}", request.archive))
                .items(&request.files)
                .defaults(&defaults)
                .interact_opt()
        })
        .await;

        match picked {
            Ok(Ok(Some(indices))) => pick(&files, &indices),
            Ok(Ok(None)) => {
                tracing::info!("Selection dismissed; installing nothing");
                Vec::new()
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Terminal prompt failed; installing nothing");
                Vec::new()
            }
            Err(e) => {
                tracing::error!(error = %e, "Prompt task failed");
                Vec::new()
            }
        }
    }
}

fn pick(files: &[String], indices: &[usize]) -> Vec<String> {
    indices
        .iter()
        .filter_map(|&i| files.get(i).cloned())
        .collect()
}
