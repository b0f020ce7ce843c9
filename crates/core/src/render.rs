//! Rasterizes page-oriented documents through external renderers.

use crate::error::IngestError;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// 1-based, contiguous.
    pub number: u32,
    pub png: Bytes,
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    fn name(&self) -> &str;

    async fn render(
        &self,
        pdf: &[u8],
        max_pages: u32,
        dpi: u32,
    ) -> Result<Vec<RenderedPage>, IngestError>;
}

const OUTPUT_PREFIX: &str = "page";

/// poppler's `pdftoppm`.
#[derive(Debug, Clone)]
pub struct PdftoppmRenderer {
    pub program: String,
}

impl Default for PdftoppmRenderer {
    fn default() -> Self {
        Self {
            program: "pdftoppm".to_string(),
        }
    }
}

#[async_trait]
impl PageRenderer for PdftoppmRenderer {
    fn name(&self) -> &str {
        "pdftoppm"
    }

    async fn render(
        &self,
        pdf: &[u8],
        max_pages: u32,
        dpi: u32,
    ) -> Result<Vec<RenderedPage>, IngestError> {
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join("input.pdf");
        tokio::fs::write(&input, pdf).await?;

        let mut command = Command::new(&self.program);
        command
            .arg("-png")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-f")
            .arg("1")
            .arg("-l")
            .arg(max_pages.to_string())
            .arg(&input)
            .arg(workdir.path().join(OUTPUT_PREFIX));

        run_renderer(self.name(), command).await?;
        collect_pages(workdir.path(), max_pages).await
    }
}

/// MuPDF's `mutool draw`.
#[derive(Debug, Clone)]
pub struct MutoolRenderer {
    pub program: String,
}

impl Default for MutoolRenderer {
    fn default() -> Self {
        Self {
            program: "mutool".to_string(),
        }
    }
}

#[async_trait]
impl PageRenderer for MutoolRenderer {
    fn name(&self) -> &str {
        "mutool"
    }

    async fn render(
        &self,
        pdf: &[u8],
        max_pages: u32,
        dpi: u32,
    ) -> Result<Vec<RenderedPage>, IngestError> {
        let workdir = tempfile::tempdir()?;
        let input = workdir.path().join("input.pdf");
        tokio::fs::write(&input, pdf).await?;

        let mut command = Command::new(&self.program);
        command
            .arg("draw")
            .arg("-q")
            .arg("-r")
            .arg(dpi.to_string())
            .arg("-o")
            .arg(workdir.path().join(format!("{OUTPUT_PREFIX}-%d.png")))
            .arg(&input)
            .arg(format!("1-{max_pages}"));

        run_renderer(self.name(), command).await?;
        collect_pages(workdir.path(), max_pages).await
    }
}

/// Tries `primary`, then `fallback` with the same page cap and DPI.
pub struct FallbackRenderer {
    primary: Box<dyn PageRenderer>,
    fallback: Box<dyn PageRenderer>,
}

impl FallbackRenderer {
    pub fn new(primary: Box<dyn PageRenderer>, fallback: Box<dyn PageRenderer>) -> Self {
        Self { primary, fallback }
    }
}

impl Default for FallbackRenderer {
    fn default() -> Self {
        Self::new(
            Box::new(PdftoppmRenderer::default()),
            Box::new(MutoolRenderer::default()),
        )
    }
}

#[async_trait]
impl PageRenderer for FallbackRenderer {
    fn name(&self) -> &str {
        self.primary.name()
    }

    async fn render(
        &self,
        pdf: &[u8],
        max_pages: u32,
        dpi: u32,
    ) -> Result<Vec<RenderedPage>, IngestError> {
        match self.primary.render(pdf, max_pages, dpi).await {
            Ok(pages) if !pages.is_empty() => Ok(pages),
            Ok(_) => {
                warn!(renderer = self.primary.name(), "primary renderer produced no pages");
                self.fallback.render(pdf, max_pages, dpi).await
            }
            Err(error) => {
                warn!(
                    renderer = self.primary.name(),
                    fallback = self.fallback.name(),
                    %error,
                    "primary renderer failed"
                );
                self.fallback.render(pdf, max_pages, dpi).await.map_err(|fallback_error| {
                    IngestError::Render(format!("{error}; {fallback_error}"))
                })
            }
        }
    }
}

async fn run_renderer(name: &str, mut command: Command) -> Result<(), IngestError> {
    command.kill_on_drop(true);
    let output = command.output().await.map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            IngestError::Render(format!("{name} is not installed"))
        } else {
            IngestError::Io(error)
        }
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(IngestError::Render(format!(
            "{name} exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

/// Reads `page-N.png` (any zero padding) from `dir`, ordered by N.
async fn collect_pages(dir: &Path, max_pages: u32) -> Result<Vec<RenderedPage>, IngestError> {
    let mut numbered = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let file_name = entry.file_name();
        let Some(number) = file_name.to_str().and_then(page_number_from_name) else {
            continue;
        };
        if number == 0 || number > max_pages {
            continue;
        }
        numbered.push((number, entry.path()));
    }
    numbered.sort_by_key(|(number, _)| *number);

    let mut pages = Vec::with_capacity(numbered.len());
    for (position, (number, path)) in numbered.into_iter().enumerate() {
        if number != position as u32 + 1 {
            return Err(IngestError::Render(format!(
                "renderer skipped page {}",
                position + 1
            )));
        }
        let png = tokio::fs::read(&path).await?;
        pages.push(RenderedPage {
            number,
            png: Bytes::from(png),
        });
    }

    debug!(pages = pages.len(), "collected rendered pages");
    Ok(pages)
}

fn page_number_from_name(name: &str) -> Option<u32> {
    name.strip_prefix(OUTPUT_PREFIX)?
        .strip_prefix('-')?
        .strip_suffix(".png")?
        .parse()
        .ok()
}
