//! Append-only JSON lines store (simple backend)

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::record::MetricPoint;

use super::frame::MetricFrame;
use super::traits::MetricStore;

/// One JSON line per point, fsynced after every save
#[derive(Debug)]
pub struct JsonlStore {
    path: PathBuf,
    file: Option<File>,
}

impl JsonlStore {
    /// Open a store; the file is created on the first save
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path, file: None })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut File> {
        if self.file.is_none() {
            let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
            self.file = Some(file);
        }
        self.file.as_mut().ok_or(Error::Closed)
    }
}

/// Read all parseable points from a JSON lines file
pub(crate) fn read_points(path: &Path) -> Result<Vec<MetricPoint>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::NotFound(path.display().to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    let mut points = Vec::new();
    let mut skipped = 0usize;
    for line in BufReader::new(file).split(b'\n') {
        let line = line?;
        let text = String::from_utf8_lossy(&line);
        if text.trim().is_empty() {
            continue;
        }
        match MetricPoint::from_json_line(&text) {
            Some(point) => points.push(point),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!(path = %path.display(), skipped, "skipped corrupted metric lines");
    }
    Ok(points)
}

impl MetricStore for JsonlStore {
    fn save(&mut self, point: &MetricPoint) -> Result<()> {
        point.validate()?;
        let line = point.to_json_line()?;
        let file = self.writer()?;
        file.write_all(line.as_bytes())?;
        file.flush()?;
        file.sync_data()?;
        Ok(())
    }

    fn load(&self, metrics: Option<&[&str]>) -> Result<MetricFrame> {
        let points = read_points(&self.path)?;
        let frame = MetricFrame::from_points(&points);
        Ok(match metrics {
            Some(names) => frame.select(names),
            None => frame,
        })
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.sync_all()?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.finish()?;
        self.file = None;
        Ok(())
    }
}
