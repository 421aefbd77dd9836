use std::io::BufWriter;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use csv::{Writer, WriterBuilder};
use tempfile::NamedTempFile;

use crate::table::Delimiter;

pub struct AtomicCsvWriter {
    writer: Writer<BufWriter<NamedTempFile>>,
    final_path: PathBuf,
}

impl AtomicCsvWriter {
    pub fn new(final_path: impl AsRef<Path>, delimiter: Delimiter) -> Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let parent_dir = match final_path.parent() {
            Some(parent) if parent.as_os_str().is_empty() => Path::new("."),
            Some(parent) => parent,
            None => {
                return Err(anyhow!(
                    "cannot determine parent directory for {}",
                    final_path.display()
                ));
            }
        };

        let temp_file = NamedTempFile::new_in(parent_dir).with_context(|| {
            format!("failed to create temporary file in {}", parent_dir.display())
        })?;
        let writer = WriterBuilder::new()
            .delimiter(delimiter.as_byte())
            .from_writer(BufWriter::new(temp_file));

        Ok(Self { writer, final_path })
    }

    pub fn write_row<I, T>(&mut self, record: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        self.writer
            .write_record(record)
            .with_context(|| format!("failed to write record for {}", self.final_path.display()))
    }

    /// Flushes everything and renames the temporary file onto the final path.
    pub fn finish(self) -> Result<PathBuf> {
        let final_path = self.final_path;
        let buf_writer = self.writer.into_inner().map_err(|err| {
            anyhow!(
                "failed to flush CSV writer for {}: {}",
                final_path.display(),
                err.error()
            )
        })?;
        let temp_file = buf_writer.into_inner().map_err(|err| {
            anyhow!(
                "failed to flush buffer for {}: {}",
                final_path.display(),
                err.error()
            )
        })?;
        temp_file.persist(&final_path).map_err(|err| {
            anyhow!("failed to persist {}: {}", final_path.display(), err.error)
        })?;
        Ok(final_path)
    }
}
