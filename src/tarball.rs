//! Packing of the image build context.

use flate2::{write::GzEncoder, Compression};
use std::{
    fs,
    io::{self, Write},
    path::{Component, Path},
};
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

use crate::errors::{Error, Result};

/// A file that only exists in memory but is shipped as part of the build
/// context, e.g. a rendered `Dockerfile`
#[derive(Clone, Debug, PartialEq)]
pub struct ContextFile {
    pub path: String,
    pub contents: Vec<u8>,
    pub mode: u32,
}

impl ContextFile {
    pub fn new<P, C>(
        path: P,
        contents: C,
        mode: u32,
    ) -> Self
    where
        P: Into<String>,
        C: Into<Vec<u8>>,
    {
        ContextFile {
            path: path.into(),
            contents: contents.into(),
            mode,
        }
    }
}

/// Writes a gzip'd tarball of the directory at `path` into `buf`, skipping
/// whatever its `.dockerignore` excludes and appending `extras` last.
pub fn dir<W>(
    buf: W,
    path: &Path,
    extras: &[ContextFile],
) -> Result<()>
where
    W: Write,
{
    let base_path = path.canonicalize()?;
    if !base_path.is_dir() {
        return Err(Error::InvalidArgument(format!(
            "build context {} is not a directory",
            base_path.display()
        )));
    }
    let rules = IgnoreRules::load(&base_path)?;

    let mut archive = Builder::new(GzEncoder::new(buf, Compression::best()));
    // links are archived as links, the way the docker cli sends them
    archive.follow_symlinks(false);

    let walk = WalkDir::new(&base_path)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !rules.is_ignored(&context_name(&base_path, entry.path())));
    for entry in walk {
        let entry = entry.map_err(io::Error::from)?;
        let relative = context_name(&base_path, entry.path());
        if extras.iter().any(|f| f.path == relative) {
            continue;
        }
        if entry.file_type().is_dir() {
            archive.append_dir(&relative, entry.path())?;
        } else {
            archive.append_path_with_name(entry.path(), &relative)?;
        }
    }

    for file in extras {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(file.contents.len() as u64);
        header.set_mode(file.mode);
        archive.append_data(&mut header, &file.path, &file.contents[..])?;
    }

    archive.into_inner()?.finish()?;

    Ok(())
}

/// `/`-separated path of `path` below the context root
fn context_name(
    base: &Path,
    path: &Path,
) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Exclusion patterns read from `.dockerignore`
#[derive(Debug, Default)]
pub(crate) struct IgnoreRules {
    patterns: Vec<Vec<String>>,
}

impl IgnoreRules {
    pub(crate) fn load(context: &Path) -> Result<IgnoreRules> {
        let file = context.join(".dockerignore");
        if !file.is_file() {
            return Ok(IgnoreRules::default());
        }
        Ok(IgnoreRules::parse(&fs::read_to_string(file)?))
    }

    pub(crate) fn parse(contents: &str) -> IgnoreRules {
        let mut patterns = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('!') {
                log::debug!("ignoring unsupported .dockerignore exception {}", line);
                continue;
            }
            let segments: Vec<String> = Path::new(line.trim_end_matches('/'))
                .components()
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect();
            if !segments.is_empty() {
                patterns.push(segments);
            }
        }
        IgnoreRules { patterns }
    }

    /// A pattern excludes the path it names and everything below it
    pub(crate) fn is_ignored(
        &self,
        relative: &str,
    ) -> bool {
        let segments: Vec<&str> = relative.split('/').collect();
        self.patterns.iter().any(|pattern| {
            pattern.len() <= segments.len()
                && pattern
                    .iter()
                    .zip(&segments)
                    .all(|(p, s)| glob_segment(p.as_bytes(), s.as_bytes()))
        })
    }
}

/// `*` matches any run of characters and `?` a single one, within one segment
fn glob_segment(
    pattern: &[u8],
    name: &[u8],
) -> bool {
    match (pattern.first(), name.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_segment(&pattern[1..], name)
                || (!name.is_empty() && glob_segment(pattern, &name[1..]))
        }
        (Some(b'?'), Some(_)) => glob_segment(&pattern[1..], &name[1..]),
        (Some(p), Some(n)) if p == n => glob_segment(&pattern[1..], &name[1..]),
        _ => false,
    }
}
