use crate::prelude::*;

use crate::source_map::ProjectItem;
use globset::GlobBuilder;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// ZScript/ACS/DECORATE sources, the same set the engine itself scans for.
pub const SOURCE_FILE_GLOBS: [&str; 3] = ["**/*.{zs,zsc,zc,acs,dec}", "**/DECORATE", "**/ACS"];
pub const SCAN_EXCLUDE_GLOB: &str = "**/node_modules/**";
pub const SCAN_MAX_RESULTS: usize = 100_000;

/// File-listing capability used to build the source index.  Abstracted so the
/// directory walk can be replaced by a virtual filesystem (archive browsing
/// lives outside this crate).
pub trait FileSearch: Send + Sync {
    fn find_files(
        &self,
        include: &str,
        exclude: &str,
        max_results: usize,
        roots: &[PathBuf],
    ) -> Result<Vec<PathBuf>, Error>;
}

/// Walks real directories.
pub struct WorkspaceScanner;

impl FileSearch for WorkspaceScanner {
    fn find_files(
        &self,
        include: &str,
        exclude: &str,
        max_results: usize,
        roots: &[PathBuf],
    ) -> Result<Vec<PathBuf>, Error> {
        let include = GlobBuilder::new(include)
            .case_insensitive(true)
            .build()?
            .compile_matcher();
        let exclude = GlobBuilder::new(exclude)
            .case_insensitive(true)
            .build()?
            .compile_matcher();

        let mut found = vec![];
        for root in roots {
            for entry in WalkDir::new(root).follow_links(false) {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        debug!("Skipping unreadable entry: {}", err);
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
                if exclude.is_match(relative) {
                    continue;
                }
                if include.is_match(relative) {
                    found.push(entry.path().to_path_buf());
                    if found.len() >= max_results {
                        return Ok(found);
                    }
                }
            }
        }
        Ok(found)
    }
}

/// One-time project scan: every source file under every project root, tagged
/// with the index of its owning project.
pub fn scan_projects(
    search: &dyn FileSearch,
    projects: &[ProjectItem],
) -> Vec<(String, usize)> {
    let mut entries = vec![];
    for (index, project) in projects.iter().enumerate() {
        let roots = [project.root.clone()];
        for glob in SOURCE_FILE_GLOBS {
            match search.find_files(glob, SCAN_EXCLUDE_GLOB, SCAN_MAX_RESULTS, &roots) {
                Ok(paths) => {
                    entries.extend(
                        paths
                            .into_iter()
                            .map(|p| (p.to_string_lossy().into_owned(), index)),
                    );
                }
                Err(err) => error!("Project scan failed under {:?}: {}", project.root, err),
            }
        }
    }
    entries
}

/// Whether the path looks like a file archive rather than a directory
/// project, by extension.
pub fn is_archive_file(path: &Path) -> bool {
    const ARCHIVE_EXTENSIONS: [&str; 10] =
        ["wad", "zip", "pk3", "pk7", "deh", "bex", "iwad", "pwad", "ipk3", "ipk7"];
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ARCHIVE_EXTENSIONS.iter().any(|a| ext.eq_ignore_ascii_case(a)),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn make_tree(root: &Path) {
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join("node_modules/dep")).unwrap();
        fs::write(root.join("src/a.zs"), "class A {}").unwrap();
        fs::write(root.join("src/B.ZSC"), "class B {}").unwrap();
        fs::write(root.join("DECORATE"), "").unwrap();
        fs::write(root.join("readme.txt"), "").unwrap();
        fs::write(root.join("node_modules/dep/c.zs"), "").unwrap();
    }

    #[test]
    fn test_scan_projects() {
        let dir = std::env::temp_dir().join(format!("gzdap-scan-{}", std::process::id()));
        make_tree(&dir);

        let projects = vec![ProjectItem {
            root: dir.clone(),
            archive: "proj.pk3".into(),
        }];
        let entries = scan_projects(&WorkspaceScanner, &projects);

        let mut names: Vec<&str> = entries
            .iter()
            .map(|(p, _)| Path::new(p).file_name().unwrap().to_str().unwrap())
            .collect();
        names.sort();
        assert_eq!(names, vec!["B.ZSC", "DECORATE", "a.zs"]);
        assert!(entries.iter().all(|&(_, project)| project == 0));

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_is_archive_file() {
        assert!(is_archive_file(Path::new("mod.pk3")));
        assert!(is_archive_file(Path::new("DOOM2.WAD")));
        assert!(!is_archive_file(Path::new("/home/user/project")));
    }
}
