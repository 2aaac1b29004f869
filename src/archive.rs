//! Export archive extraction.
//!
//! Unpacks a project's export archive into its collection directory. Only
//! page-description entries (`include_globs`) and document-level metadata
//! entries (`metadata_globs`) are kept. Each kept entry is written under a
//! temporary name built from a running counter, since the real document and
//! page identifiers are only known once the reconciler has read the file.

use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{ExtractSummary, ProjectConfig};
use crate::progress::{Stage, StageProgress};

/// One kept archive entry and where it was written.
#[derive(Debug, Clone)]
pub struct ExtractedFile {
    pub path: PathBuf,
    /// Entry name inside the archive.
    pub entry: String,
}

impl ExtractedFile {
    /// Archive folder of the document this entry belongs to: the parent of
    /// the page folder for page files, the entry's own folder otherwise.
    pub fn document_folder(&self) -> &str {
        let parent = match self.entry.rfind('/') {
            Some(i) => &self.entry[..i],
            None => "",
        };
        match parent.rsplit_once('/') {
            Some((folder, "page")) => folder,
            None if parent == "page" => "",
            _ => parent,
        }
    }
}

/// Files written by one extraction run, in archive order.
#[derive(Debug, Default)]
pub struct ExtractedFiles {
    pub pages: Vec<ExtractedFile>,
    pub metadata: Vec<ExtractedFile>,
}

impl ExtractedFiles {
    pub fn summary(&self) -> ExtractSummary {
        ExtractSummary {
            page_files: self.pages.len() as u64,
            metadata_files: self.metadata.len() as u64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Page,
    Metadata,
}

/// Entry filter built from the archive configuration.
struct EntryFilter {
    pages: GlobSet,
    metadata: GlobSet,
}

impl EntryFilter {
    fn new(include_globs: &[String], metadata_globs: &[String]) -> PipelineResult<Self> {
        Ok(Self {
            pages: build_globset(include_globs)?,
            metadata: build_globset(metadata_globs)?,
        })
    }

    fn classify(&self, name: &str) -> Option<EntryKind> {
        let name = name.trim_start_matches('/');
        if !name.to_ascii_lowercase().ends_with(".xml") {
            return None;
        }
        if self.pages.is_match(name) {
            Some(EntryKind::Page)
        } else if self.metadata.is_match(name) {
            Some(EntryKind::Metadata)
        } else {
            None
        }
    }
}

fn build_globset(patterns: &[String]) -> PipelineResult<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            PipelineError::Configuration(format!("invalid archive glob '{}': {}", pattern, e))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| PipelineError::Configuration(e.to_string()))
}

/// Temporary name of the `counter`-th page file of a collection.
pub fn temp_page_name(collection_id: &str, counter: usize) -> String {
    format!("{}_{:05}.xml", collection_id, counter)
}

fn temp_metadata_name(collection_id: &str, counter: usize) -> String {
    format!("{}_meta_{:05}.xml", collection_id, counter)
}

/// Locate the project's archive. Relative references live under the storage root.
pub fn archive_location(config: &Config, project: &ProjectConfig) -> PipelineResult<PathBuf> {
    let path = project.archive_path.as_ref().ok_or_else(|| {
        PipelineError::Configuration(format!("project {} has no export archive", project.id))
    })?;
    if path.is_absolute() {
        Ok(path.clone())
    } else {
        Ok(config.storage.root.join(path))
    }
}

/// Remove every file a previous run left in the collection directory.
fn clear_collection_dir(dir: &Path) -> PipelineResult<u64> {
    let mut removed = 0u64;
    if dir.exists() {
        for entry in WalkDir::new(dir).contents_first(true) {
            let entry = entry.map_err(|e| PipelineError::Io(e.into()))?;
            if entry.path() == dir {
                continue;
            }
            if entry.file_type().is_dir() {
                std::fs::remove_dir(entry.path())?;
            } else {
                std::fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
    }
    std::fs::create_dir_all(dir)?;
    Ok(removed)
}

type Archive = zip::ZipArchive<File>;

/// Open the archive and pick the entries to keep, in archive order.
fn open_and_select(
    archive_path: &Path,
    filter: &EntryFilter,
) -> PipelineResult<(Archive, Vec<(usize, EntryKind)>)> {
    let file = File::open(archive_path).map_err(|e| {
        PipelineError::Archive(format!("cannot open {}: {}", archive_path.display(), e))
    })?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| {
        PipelineError::Archive(format!("cannot read {}: {}", archive_path.display(), e))
    })?;

    let mut selected = Vec::new();
    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| PipelineError::Archive(e.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        if let Some(kind) = filter.classify(entry.name()) {
            selected.push((index, kind));
        }
    }
    Ok((archive, selected))
}

/// Decompress one entry to `path`, refusing entries above `max_bytes`.
/// Returns the entry name.
fn unpack_entry(
    archive: &mut Archive,
    index: usize,
    max_bytes: u64,
    path: &Path,
) -> PipelineResult<String> {
    let entry = archive
        .by_index(index)
        .map_err(|e| PipelineError::Archive(e.to_string()))?;
    let entry_name = entry.name().to_string();
    let mut content = Vec::new();
    entry
        .take(max_bytes + 1)
        .read_to_end(&mut content)
        .map_err(|e| PipelineError::Archive(format!("{}: {}", entry_name, e)))?;
    if content.len() as u64 > max_bytes {
        return Err(PipelineError::Archive(format!(
            "entry {} exceeds size limit ({} bytes)",
            entry_name, max_bytes
        )));
    }

    let mut out = File::create(path)?;
    out.write_all(&content)?;
    Ok(entry_name)
}

/// Run zip and file work on the blocking pool.
async fn blocking<T, F>(work: F) -> PipelineResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> PipelineResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineError::Archive(format!("extraction task failed: {}", e)))?
}

/// Unpack the project's archive into its collection directory.
///
/// Fails the stage when the archive cannot be opened or read, or when it
/// holds no page files. Nothing is handed to the reconciler in that case.
pub async fn extract_archive(
    config: &Config,
    project: &ProjectConfig,
    progress: &dyn StageProgress,
) -> PipelineResult<ExtractedFiles> {
    let archive_path = archive_location(config, project)?;
    let filter = EntryFilter::new(
        &config.archive.include_globs,
        &config.archive.metadata_globs,
    )?;

    // Decide up front which entries to keep so progress has a known total.
    let open_path = archive_path.clone();
    let (mut archive, selected) = blocking(move || open_and_select(&open_path, &filter)).await?;

    if !selected.iter().any(|(_, kind)| *kind == EntryKind::Page) {
        return Err(PipelineError::EmptyArchive(archive_path.display().to_string()));
    }

    let target_dir = config.storage.collection_dir(&project.collection_id);
    let clear_dir = target_dir.clone();
    let removed = blocking(move || clear_collection_dir(&clear_dir)).await?;
    debug!(dir = %target_dir.display(), removed, "cleared collection directory");

    let max_bytes = config.archive.max_entry_bytes;
    let total = selected.len() as u64;
    let mut files = ExtractedFiles::default();

    for (done, (index, kind)) in selected.into_iter().enumerate() {
        let path = match kind {
            EntryKind::Page => {
                target_dir.join(temp_page_name(&project.collection_id, files.pages.len()))
            }
            EntryKind::Metadata => target_dir.join(temp_metadata_name(
                &project.collection_id,
                files.metadata.len(),
            )),
        };

        // The archive moves into the blocking task and comes back with the entry.
        let out_path = path.clone();
        let (returned, entry_name) = blocking(move || {
            let name = unpack_entry(&mut archive, index, max_bytes, &out_path)?;
            Ok((archive, name))
        })
        .await?;
        archive = returned;

        let extracted = ExtractedFile {
            path,
            entry: entry_name.clone(),
        };
        match kind {
            EntryKind::Page => files.pages.push(extracted),
            EntryKind::Metadata => files.metadata.push(extracted),
        }

        progress
            .advance(
                Stage::Extract,
                done as u64 + 1,
                total,
                &format!("extracted {}", entry_name),
            )
            .await?;
    }

    info!(
        project_id = project.id,
        archive = %archive_path.display(),
        pages = files.pages.len(),
        metadata = files.metadata.len(),
        "archive extracted"
    );
    Ok(files)
}
