//! Sequential image path generation.

use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{Datelike, Utc};
use thiserror::Error;
use tracing::debug;

use crate::eval::{Context, EvalError, Template, Value};
use crate::exposure::CameraContext;

#[derive(Debug, Error)]
pub enum NamerError {
    #[error("basename {0:?} has no {{num}} placeholder")]
    MissingNumPlaceholder(String),
    #[error("basename must contain exactly one {{num}} placeholder")]
    MultipleNumPlaceholders,
    #[error(transparent)]
    Template(#[from] EvalError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Generates sequential, collision-free paths for new images.
///
/// The directory and basename are independent templates resolved against
/// `{camera.<attr>}` and `{date.<attr>}` (the time of the call, with
/// `mjd`, `isot`, `year`, `month` and `day` fields); the basename must
/// also contain a single `{num}` placeholder for the sequence number:
///
/// ```text
/// ImageNamer::new("{camera.name}-{num:04d}.fits", "/data/{camera.uid}/{date.mjd}")
/// ```
///
/// Each call scans the resolved directory and issues the smallest sequence
/// number that is both unused there and above the last number this
/// instance issued, so back-to-back calls never collide even before the
/// first file lands on disk. When the resolved directory changes between
/// calls (the date placeholder rolled over), the sequence restarts from
/// the new directory's contents.
#[derive(Clone, Debug)]
pub struct ImageNamer {
    basename: Template,
    dirname: Template,
    overwrite: bool,
    reset_sequence: bool,
    last_num: u32,
    previous_dir: Option<PathBuf>,
}

impl ImageNamer {
    pub fn new(basename: &str, dirname: &str) -> Result<Self, NamerError> {
        let basename_template = Template::parse(basename)?;
        match basename_template.roots().filter(|root| *root == "num").count() {
            0 => return Err(NamerError::MissingNumPlaceholder(basename.to_string())),
            1 => {}
            _ => return Err(NamerError::MultipleNumPlaceholders),
        }

        Ok(Self {
            basename: basename_template,
            dirname: Template::parse(dirname)?,
            overwrite: false,
            reset_sequence: true,
            last_num: 0,
            previous_dir: None,
        })
    }

    /// Always issue `last + 1` without scanning the directory, overwriting
    /// whatever exists.
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Whether a directory change restarts the sequence (on by default).
    pub fn with_reset_sequence(mut self, reset: bool) -> Self {
        self.reset_sequence = reset;
        self
    }

    /// The number issued by the most recent call.
    pub fn last_num(&self) -> u32 {
        self.last_num
    }

    /// Resolve the next unused path for `camera`, creating the target
    /// directory if needed.
    pub fn next_path(&mut self, camera: &CameraContext) -> Result<PathBuf, NamerError> {
        let context = namer_context(camera);

        let dir = PathBuf::from(self.dirname.render(&context)?);
        if self.previous_dir.as_ref().is_some_and(|prev| prev != &dir) && self.reset_sequence {
            debug!(dir = %dir.display(), "directory changed, resetting sequence");
            self.last_num = 0;
        }
        self.previous_dir = Some(dir.clone());

        // Tolerates concurrent creation: an already existing directory is
        // success.
        std::fs::create_dir_all(&dir)?;

        // Resolve everything except {num}, leaving a single hole for the
        // sequence number. The probes differ in every digit position so
        // zero padding cannot leak into the common prefix.
        let (prefix, suffix) = {
            let probe_low = self.basename.render(&context.clone().with("num", 0))?;
            let probe_high = self
                .basename
                .render(&context.clone().with("num", 11_111_111))?;
            split_at_difference(&probe_low, &probe_high)
        };

        let num = if self.overwrite {
            self.last_num + 1
        } else {
            let used = used_numbers(&dir, &prefix, &suffix)?;
            (self.last_num + 1..)
                .find(|n| !used.contains(n))
                .unwrap_or(self.last_num + 1)
        };

        let path = dir.join(self.basename.render(&context.with("num", num as i64))?);
        self.last_num = num;

        Ok(path)
    }
}

fn namer_context(camera: &CameraContext) -> Context {
    let now = Utc::now();
    let unix = now.timestamp() as f64;
    let mut date = std::collections::BTreeMap::new();
    date.insert(
        "mjd".to_string(),
        Value::Int((unix / 86400.0 + 40587.0) as i64),
    );
    date.insert(
        "isot".to_string(),
        Value::Str(now.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()),
    );
    date.insert("year".to_string(), Value::Int(now.year() as i64));
    date.insert("month".to_string(), Value::Int(now.month() as i64));
    date.insert("day".to_string(), Value::Int(now.day() as i64));

    Context::new()
        .with("camera", camera.to_value())
        .with("date", Value::Map(date))
}

/// Split two renderings of the basename (with different sequence numbers)
/// into the common prefix and suffix around the sequence field.
fn split_at_difference(low: &str, high: &str) -> (String, String) {
    let prefix_len = low
        .bytes()
        .zip(high.bytes())
        .take_while(|(a, b)| a == b)
        .count();
    let suffix_len = low
        .bytes()
        .rev()
        .zip(high.bytes().rev())
        .take_while(|(a, b)| a == b)
        .count()
        .min(low.len() - prefix_len - 1);
    (
        low[..prefix_len].to_string(),
        low[low.len() - suffix_len..].to_string(),
    )
}

fn used_numbers(
    dir: &std::path::Path,
    prefix: &str,
    suffix: &str,
) -> Result<BTreeSet<u32>, NamerError> {
    let mut used = BTreeSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let Some(middle) = name
            .strip_prefix(prefix)
            .and_then(|rest| rest.strip_suffix(suffix))
        else {
            continue;
        };
        if !middle.is_empty() && middle.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(num) = middle.parse::<u32>() {
                used.insert(num);
            }
        }
    }
    Ok(used)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera() -> CameraContext {
        CameraContext::new("sbig").with_uid("SBIG_001")
    }

    #[test]
    fn basename_requires_a_num_placeholder() {
        assert!(matches!(
            ImageNamer::new("{camera.name}.fits", "."),
            Err(NamerError::MissingNumPlaceholder(_))
        ));
    }

    #[test]
    fn sequence_starts_at_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut namer =
            ImageNamer::new("{camera.name}-{num:04d}.fits", dir.path().to_str().unwrap()).unwrap();

        let path = namer.next_path(&camera()).unwrap();
        assert_eq!(path.file_name().unwrap(), "sbig-0001.fits");
    }

    #[test]
    fn existing_files_advance_the_sequence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sbig-0001.fits"), b"").unwrap();

        let mut namer =
            ImageNamer::new("{camera.name}-{num:04d}.fits", dir.path().to_str().unwrap()).unwrap();
        let path = namer.next_path(&camera()).unwrap();
        assert_eq!(path.file_name().unwrap(), "sbig-0002.fits");
    }

    #[test]
    fn holes_below_the_sequence_are_filled() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sbig-0001.fits"), b"").unwrap();
        std::fs::write(dir.path().join("sbig-0003.fits"), b"").unwrap();

        let mut namer =
            ImageNamer::new("{camera.name}-{num:04d}.fits", dir.path().to_str().unwrap()).unwrap();
        let path = namer.next_path(&camera()).unwrap();
        assert_eq!(path.file_name().unwrap(), "sbig-0002.fits");
    }

    #[test]
    fn back_to_back_calls_never_collide() {
        let dir = tempfile::tempdir().unwrap();
        let mut namer =
            ImageNamer::new("{camera.name}-{num:04d}.fits", dir.path().to_str().unwrap()).unwrap();

        // No files are written between calls; the instance still advances.
        let first = namer.next_path(&camera()).unwrap();
        let second = namer.next_path(&camera()).unwrap();
        assert_ne!(first, second);
        assert_eq!(second.file_name().unwrap(), "sbig-0002.fits");
    }

    #[test]
    fn unrelated_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("other-0005.fits"), b"").unwrap();
        std::fs::write(dir.path().join("sbig-xxxx.fits"), b"").unwrap();

        let mut namer =
            ImageNamer::new("{camera.name}-{num:04d}.fits", dir.path().to_str().unwrap()).unwrap();
        let path = namer.next_path(&camera()).unwrap();
        assert_eq!(path.file_name().unwrap(), "sbig-0001.fits");
    }

    #[test]
    fn directory_change_resets_the_sequence() {
        let root = tempfile::tempdir().unwrap();
        let mut namer = ImageNamer::new(
            "img-{num:04d}.fits",
            &format!("{}/{{camera.name}}", root.path().display()),
        )
        .unwrap();

        namer.next_path(&CameraContext::new("east")).unwrap();
        namer.next_path(&CameraContext::new("east")).unwrap();
        assert_eq!(namer.last_num(), 2);

        // The dirname template now resolves differently: the counter
        // restarts against the new directory's contents.
        let path = namer.next_path(&CameraContext::new("west")).unwrap();
        assert_eq!(namer.last_num(), 1);
        assert!(path.ends_with("west/img-0001.fits"));
    }

    #[test]
    fn overwrite_skips_the_directory_scan() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sbig-0001.fits"), b"").unwrap();

        let mut namer =
            ImageNamer::new("{camera.name}-{num:04d}.fits", dir.path().to_str().unwrap())
                .unwrap()
                .with_overwrite(true);
        let path = namer.next_path(&camera()).unwrap();
        assert_eq!(path.file_name().unwrap(), "sbig-0001.fits");
    }

    #[test]
    fn directory_is_created() {
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("new").join("nested");

        let mut namer = ImageNamer::new("img-{num:02d}.fits", target.to_str().unwrap()).unwrap();
        let path = namer.next_path(&camera()).unwrap();
        assert!(target.is_dir());
        assert_eq!(path.file_name().unwrap(), "img-01.fits");
    }
}
