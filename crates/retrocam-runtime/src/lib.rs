use std::path::Path;

use retrocam_core::CoreError;

mod backend;
mod pipeline;

pub use backend::LocalImageBackend;
pub use pipeline::{LatestOnly, Pipeline};
pub use tokio_util::sync::CancellationToken;

pub async fn read_input(path: &Path) -> Result<Vec<u8>, CoreError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| CoreError::Read(format!("{}: {}", path.display(), e)))
}
