//! Archive sinks: where snapshots go.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;

/// External archive destination. Failures are reported as a message string;
/// the policy logs them and moves on.
pub trait ArchiveSink: Send {
    fn archive(
        &self,
        display_name: &str,
        input_paths: &[PathBuf],
        bucket: &str,
        key: &str,
    ) -> std::result::Result<(), String>;
}

/// Writes `.tgz` snapshots under a local directory, laid out as
/// `{output_dir}/{bucket}/{key}`.
pub struct TgzFileSink {
    output_dir: PathBuf,
}

impl TgzFileSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    fn write_tgz(&self, input_paths: &[PathBuf], out_file: &Path) -> std::io::Result<()> {
        if let Some(parent) = out_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let out = File::create(out_file)?;
        let encoder = GzEncoder::new(out, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for path in input_paths {
            let name = path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data"));
            if path.is_dir() {
                builder.append_dir_all(&name, path)?;
            } else if path.is_file() {
                builder.append_path_with_name(path, &name)?;
            }
        }
        builder.into_inner()?.finish()?;
        Ok(())
    }
}

impl ArchiveSink for TgzFileSink {
    fn archive(
        &self,
        display_name: &str,
        input_paths: &[PathBuf],
        bucket: &str,
        key: &str,
    ) -> std::result::Result<(), String> {
        let out_file = self.output_dir.join(bucket).join(key);
        self.write_tgz(input_paths, &out_file).map_err(|err| {
            format!(
                "writing {} for {display_name} failed: {err}",
                out_file.display()
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tgz_sink_snapshots_a_data_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let data = tmp.path().join("data");
        std::fs::create_dir_all(data.join("shard-rs0/node0")).unwrap();
        std::fs::write(data.join("shard-rs0/node0/WiredTiger.wt"), b"state").unwrap();

        let sink = TgzFileSink::new(tmp.path().join("archive"));
        sink.archive(
            "jstests/core/find.js",
            &[data],
            "mongodatafiles",
            "mongo-data-task0-find-1-0.tgz",
        )
        .unwrap();

        let out = tmp
            .path()
            .join("archive/mongodatafiles/mongo-data-task0-find-1-0.tgz");
        let metadata = std::fs::metadata(&out).unwrap();
        assert!(metadata.len() > 0);
    }

    #[test]
    fn unwritable_destination_reports_a_message() {
        let tmp = tempfile::tempdir().unwrap();
        // A file where the output directory should be.
        let blocker = tmp.path().join("archive");
        std::fs::write(&blocker, b"").unwrap();

        let sink = TgzFileSink::new(&blocker);
        let err = sink
            .archive("a.js", &[tmp.path().to_path_buf()], "bucket", "key.tgz")
            .unwrap_err();
        assert!(err.contains("key.tgz"));
    }
}
