//! NDJSON export processor
//!
//! Writes every payload of a unit as one line of
//! `<output_dir>/<resource_type_id>/<partition>-<unit>.ndjson`. Each delivery
//! writes its own `.part` file, renamed into place only when the whole range
//! has been written, so a redelivered unit replaces its file wholesale and an
//! overlapping stale delivery never touches the current owner's output.

use super::base::{UnitProcessor, UnitProgress};
use crate::Result;
use async_trait::async_trait;
use ferrum_bulk_queue::{PayloadStream, WorkUnit};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tokio::{
    fs,
    io::{AsyncWriteExt, BufWriter},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct ExportProcessor {
    output_dir: PathBuf,
}

impl ExportProcessor {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_path(&self, unit: &WorkUnit) -> PathBuf {
        self.output_dir
            .join(unit.resource_type_id.to_string())
            .join(format!("{}-{}.ndjson", unit.partition_id, unit.unit_id))
    }

    fn part_path(final_path: &Path) -> PathBuf {
        final_path.with_extension(format!("ndjson.{}.part", Uuid::new_v4().simple()))
    }

    async fn write_unit(
        &self,
        part_path: &Path,
        mut payloads: PayloadStream,
        progress: &UnitProgress,
    ) -> Result<()> {
        let file = fs::File::create(part_path).await?;
        let mut writer = BufWriter::new(file);

        while let Some(payload) = payloads.next().await {
            let payload = payload?;
            writer.write_all(&payload.data).await?;
            if payload.data.last() != Some(&b'\n') {
                writer.write_all(b"\n").await?;
            }
            progress.record(1);
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl UnitProcessor for ExportProcessor {
    fn name(&self) -> &str {
        "ExportProcessor"
    }

    async fn start(&self) -> Result<()> {
        fs::create_dir_all(&self.output_dir).await?;
        tracing::info!(output_dir = %self.output_dir.display(), "Export processor ready");
        Ok(())
    }

    async fn process(
        &self,
        unit: &WorkUnit,
        payloads: PayloadStream,
        progress: &UnitProgress,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        let final_path = self.output_path(unit);
        if let Some(dir) = final_path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let part_path = Self::part_path(&final_path);

        if let Err(e) = self.write_unit(&part_path, payloads, progress).await {
            if let Err(cleanup) = fs::remove_file(&part_path).await {
                tracing::debug!(path = %part_path.display(), error = %cleanup, "Could not remove partial export");
            }
            return Err(e);
        }

        fs::rename(&part_path, &final_path).await?;

        tracing::debug!(
            path = %final_path.display(),
            resource_count = progress.count(),
            "Exported work unit"
        );
        Ok(())
    }
}
