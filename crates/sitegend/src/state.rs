//! Shared application state for request handlers.

use std::path::PathBuf;

use sitegen_ci::SiteService;

#[derive(Clone)]
pub struct AppState {
    pub service: SiteService,
    /// Parent of per-run artifact directories.
    pub artifact_root: PathBuf,
}

impl AppState {
    pub fn new(service: SiteService, artifact_root: PathBuf) -> Self {
        Self {
            service,
            artifact_root,
        }
    }
}
