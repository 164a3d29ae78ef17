//! Per-run directory layout.

use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::core::ExperimentPayload;
use crate::sandbox::SandboxError;
use crate::util::ExperimentId;

/// Captured stdout and stderr of the job, inside the output directory.
pub const LOG_FILE_NAME: &str = "job_output.log";

/// `<work_root>/<id>/payload/<entry>` plus `<work_root>/<id>/output/`.
#[derive(Debug, Clone)]
pub struct Workspace {
    run_dir: PathBuf,
    payload_dir: PathBuf,
    output_dir: PathBuf,
    entry_path: PathBuf,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> SandboxError + '_ {
    move |source| SandboxError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl Workspace {
    /// Create the directories and write the payload as a read-only file.
    ///
    /// A payload directory left over from an earlier attempt is replaced; an
    /// existing output directory is kept.
    pub fn prepare(
        work_root: &Path,
        id: &ExperimentId,
        payload: &ExperimentPayload,
    ) -> Result<Self, SandboxError> {
        let run_dir = work_root.join(id.as_str());
        let payload_dir = run_dir.join("payload");
        let output_dir = run_dir.join("output");
        let entry_path = payload_dir.join(payload.entry_file_name());

        if payload_dir.exists() {
            fs::remove_dir_all(&payload_dir).map_err(io_err(&payload_dir))?;
        }
        fs::create_dir_all(&payload_dir).map_err(io_err(&payload_dir))?;
        fs::create_dir_all(&output_dir).map_err(io_err(&output_dir))?;
        fs::write(&entry_path, payload.script.as_bytes()).map_err(io_err(&entry_path))?;
        fs::set_permissions(&entry_path, fs::Permissions::from_mode(0o444))
            .map_err(io_err(&entry_path))?;

        debug!(experiment = %id, dir = %run_dir.display(), "workspace prepared");
        Ok(Self {
            run_dir,
            payload_dir,
            output_dir,
            entry_path,
        })
    }

    /// Root of this run.
    #[must_use]
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Read-only payload directory.
    #[must_use]
    pub fn payload_dir(&self) -> &Path {
        &self.payload_dir
    }

    /// Job-writable output directory.
    #[must_use]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Script file handed to the interpreter.
    #[must_use]
    pub fn entry_path(&self) -> &Path {
        &self.entry_path
    }

    /// Captured output log.
    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.output_dir.join(LOG_FILE_NAME)
    }

    /// Remove the payload. The output directory stays as the run's result.
    pub fn teardown(&self) {
        match fs::remove_dir_all(&self.payload_dir) {
            Ok(()) => debug!(dir = %self.payload_dir.display(), "payload removed"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(dir = %self.payload_dir.display(), error = %err, "failed to remove payload"),
        }
    }
}

/// Last `max_bytes` of a file, lossily decoded. Empty when the file is missing.
#[must_use]
pub fn read_tail_bytes(path: &Path, max_bytes: u64) -> String {
    let Ok(mut file) = fs::File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    let start = len.saturating_sub(max_bytes);
    if file.seek(SeekFrom::Start(start)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

/// Last `lines` lines of a file.
pub fn read_tail_lines(path: &Path, lines: usize) -> Result<Vec<String>, SandboxError> {
    let text = fs::read_to_string(path).map_err(io_err(path))?;
    let all: Vec<&str> = text.lines().collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].iter().map(|l| (*l).to_string()).collect())
}
