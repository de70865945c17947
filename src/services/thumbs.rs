use crate::infrastructure::paths::Paths;
use crate::utils::validation::IMAGE_EXTENSIONS;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Maximum edge of a generated thumbnail.
const THUMB_SIZE: u32 = 200;

/// Extensions the thumbnailer can decode. SVG is vector and excluded.
pub fn supports_extension(ext: &str) -> bool {
    IMAGE_EXTENSIONS.iter().any(|e| *e == ext && *e != ".svg")
}

/// Generate `uploads/thumbs/<identifier>.png` for a committed upload.
pub async fn generate(paths: &Paths, name: &str, identifier: &str) -> Result<()> {
    let source = paths.file(name);
    let dest = paths.thumb(identifier);

    let data = tokio::fs::read(&source)
        .await
        .with_context(|| format!("Failed to read {name} for thumbnailing"))?;

    let thumb = tokio::task::spawn_blocking(move || -> Result<Vec<u8>> {
        let img = image::load_from_memory(&data).context("Failed to decode image")?;
        let thumb = img.thumbnail(THUMB_SIZE, THUMB_SIZE);
        let mut out = Vec::new();
        thumb
            .write_to(&mut std::io::Cursor::new(&mut out), image::ImageFormat::Png)
            .context("Failed to encode thumbnail")?;
        Ok(out)
    })
    .await??;

    tokio::fs::write(&dest, thumb)
        .await
        .with_context(|| format!("Failed to write thumbnail for {identifier}"))?;

    debug!("Thumbnail generated for {}", name);
    Ok(())
}

/// Fire-and-forget thumbnail job; failures are logged only.
pub fn spawn_job(paths: Arc<Paths>, name: String, identifier: String) {
    tokio::spawn(async move {
        if let Err(e) = generate(&paths, &name, &identifier).await {
            warn!("Thumbnail generation failed for {}: {:#}", name, e);
        }
    });
}
