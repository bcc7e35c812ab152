use crate::fsutil::{basename, index_key, is_absolute_path, join_relative, normalize_path, prefix_key, strip_root};

use gzdap_protocol::{ClientCapabilities, DebuggerLocale, Source};
use std::collections::HashMap;
use std::path::PathBuf;

/// A configured source root together with the origin tag GZDoom uses for
/// sources it loaded from there.
#[derive(Debug, Clone)]
pub struct ProjectItem {
    pub root: PathBuf,
    pub archive: String,
}

impl ProjectItem {
    fn archive_matches(&self, origin: &str) -> bool {
        let ours = self.archive.trim_end_matches(['/', '\\']);
        let theirs = origin.trim_end_matches(['/', '\\']);
        ours.eq_ignore_ascii_case(theirs)
    }
}

/// A source discovered under a project root.  `path` is the canonical
/// casing as found on disk.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub path: String,
    pub project: usize,
}

/// Bidirectional translation between client-visible paths and the debuggee's
/// (relative path, origin) identities.  Both directions are total: a source
/// without a path is returned unchanged, and an unresolvable path passes
/// through with only the locale conversion applied.
pub struct SourceResolver {
    // Descending root length, so the longest matching root wins.
    projects: Vec<ProjectItem>,
    index: HashMap<String, SourceItem>,
    client_caps: ClientCapabilities,
    locale: DebuggerLocale,
}

impl SourceResolver {
    pub fn new(mut projects: Vec<ProjectItem>, locale: DebuggerLocale) -> SourceResolver {
        projects.sort_by_key(|p| std::cmp::Reverse(prefix_key(&p.root.to_string_lossy()).len()));
        SourceResolver {
            projects,
            index: HashMap::new(),
            client_caps: ClientCapabilities::default(),
            locale,
        }
    }

    pub fn projects(&self) -> &[ProjectItem] {
        &self.projects
    }

    pub fn set_client_capabilities(&mut self, caps: ClientCapabilities) {
        self.client_caps = caps;
    }

    pub fn insert_source(&mut self, path: String, project: usize) {
        let key = index_key(&path);
        self.index.entry(key).or_insert(SourceItem { path, project });
    }

    pub fn install_index(&mut self, entries: Vec<(String, usize)>) {
        for (path, project) in entries {
            self.insert_source(path, project);
        }
    }

    pub fn source_count(&self) -> usize {
        self.index.len()
    }

    /// The scanned sources in debuggee identity form, attached to the launch
    /// request as `projectSources`.
    pub fn project_sources(&self) -> Vec<Source> {
        let mut items: Vec<&SourceItem> = self.index.values().collect();
        items.sort_by(|a, b| a.path.cmp(&b.path));
        items
            .into_iter()
            .map(|item| {
                let mut source = Source {
                    name: Some(basename(&item.path).to_string()),
                    path: Some(item.path.clone()),
                    origin: Some(self.projects[item.project].archive.clone()),
                    ..Default::default()
                };
                self.to_debugger_source(&mut source);
                source
            })
            .collect()
    }

    /// Client identity -> debuggee identity: locale-convert the path, then
    /// rewrite it relative to the longest matching project root and tag it
    /// with that project's archive.
    pub fn to_debugger_source(&self, source: &mut Source) {
        let Some(path) = source.path.clone() else {
            return;
        };
        let path = self.convert_client_path_to_debugger(&path);
        if !is_absolute_path(&path) {
            source.path = Some(path);
            return;
        }
        for project in &self.projects {
            let root = project.root.to_string_lossy();
            if let Some(relative) = strip_root(&root, &path) {
                source.path = Some(relative.to_string());
                if source.origin.is_none() {
                    source.origin = Some(project.archive.clone());
                }
                return;
            }
        }
        // No project owns it: absolute and untagged.
        source.path = Some(path);
    }

    /// Debuggee identity -> client identity: resolve the owning project by
    /// origin tag, join onto its root, and correct casing/separators through
    /// the scan index.  Unknown paths pass through uncorrected and are
    /// remembered speculatively (best effort, no rescan).
    pub fn to_client_source(&mut self, source: &mut Source) {
        let Some(path) = source.path.clone() else {
            return;
        };

        let mut candidate = path.clone();
        let mut owner = None;
        if !is_absolute_path(&path) {
            if let Some(origin) = &source.origin {
                if let Some(project) = self
                    .projects
                    .iter()
                    .position(|p| p.archive_matches(origin))
                {
                    // The debuggee may report dot segments; collapse them
                    // before touching the index.
                    let joined = join_relative(&self.projects[project].root, &path);
                    candidate = normalize_path(&joined).to_string_lossy().into_owned();
                    owner = Some(project);
                }
            }
        }

        match self.index.get(&index_key(&candidate)) {
            Some(item) => {
                source.path = Some(self.convert_debugger_path_to_client(&item.path));
                source.name = Some(basename(&item.path).to_string());
                // The source is a real file now, not a server-side reference.
                source.source_reference = Some(0);
            }
            None => {
                if let Some(project) = owner {
                    self.insert_source(candidate, project);
                }
                source.path = Some(self.convert_debugger_path_to_client(&path));
            }
        }
    }

    pub fn convert_client_line_to_debugger(&self, line: i64) -> i64 {
        if self.locale.lines_start_at1 {
            if self.client_caps.lines_start_at1 { line } else { line + 1 }
        } else if self.client_caps.lines_start_at1 {
            line - 1
        } else {
            line
        }
    }

    pub fn convert_debugger_line_to_client(&self, line: i64) -> i64 {
        if self.locale.lines_start_at1 {
            if self.client_caps.lines_start_at1 { line } else { line - 1 }
        } else if self.client_caps.lines_start_at1 {
            line + 1
        } else {
            line
        }
    }

    pub fn convert_client_column_to_debugger(&self, column: i64) -> i64 {
        if self.locale.columns_start_at1 {
            if self.client_caps.columns_start_at1 { column } else { column + 1 }
        } else if self.client_caps.columns_start_at1 {
            column - 1
        } else {
            column
        }
    }

    pub fn convert_debugger_column_to_client(&self, column: i64) -> i64 {
        if self.locale.columns_start_at1 {
            if self.client_caps.columns_start_at1 { column } else { column - 1 }
        } else if self.client_caps.columns_start_at1 {
            column + 1
        } else {
            column
        }
    }

    pub fn convert_client_path_to_debugger(&self, path: &str) -> String {
        if self.client_caps.paths_are_uris != self.locale.paths_are_uris {
            if self.client_caps.paths_are_uris {
                uri2path(path)
            } else {
                path2uri(path)
            }
        } else {
            path.to_string()
        }
    }

    pub fn convert_debugger_path_to_client(&self, path: &str) -> String {
        if self.locale.paths_are_uris != self.client_caps.paths_are_uris {
            if self.locale.paths_are_uris {
                uri2path(path)
            } else {
                path2uri(path)
            }
        } else {
            path.to_string()
        }
    }
}

fn path2uri(path: &str) -> String {
    let mut path = path.replace('\\', "/");
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_uppercase() {
        let drive = path[..1].to_lowercase();
        path.replace_range(..1, &drive);
    }
    let mut uri = String::from("file://");
    if !path.starts_with('/') {
        uri.push('/');
    }
    for byte in path.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' | b':' => {
                uri.push(byte as char)
            }
            other => uri.push_str(&format!("%{:02X}", other)),
        }
    }
    uri
}

fn uri2path(uri: &str) -> String {
    let raw = uri.strip_prefix("file://").unwrap_or(uri);
    let mut bytes = Vec::with_capacity(raw.len());
    let mut iter = raw.bytes();
    while let Some(byte) = iter.next() {
        if byte == b'%' {
            let hi = iter.next().unwrap_or(b'0');
            let lo = iter.next().unwrap_or(b'0');
            let hex = [hi, lo];
            let hex = std::str::from_utf8(&hex).unwrap_or("00");
            bytes.push(u8::from_str_radix(hex, 16).unwrap_or(b'%'));
        } else {
            bytes.push(byte);
        }
    }
    let mut path = String::from_utf8_lossy(&bytes).into_owned();
    // file:///c:/... style URIs carry a spurious leading slash before the drive.
    let stripped = path.as_bytes();
    if stripped.len() >= 3 && stripped[0] == b'/' && stripped[2] == b':' && stripped[1].is_ascii_alphabetic() {
        path.remove(0);
    }
    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use gzdap_protocol::GZDOOM_DAP_LOCALE;

    fn resolver(projects: Vec<(&str, &str)>, sources: Vec<(&str, usize)>) -> SourceResolver {
        let projects = projects
            .into_iter()
            .map(|(root, archive)| ProjectItem {
                root: PathBuf::from(root),
                archive: archive.to_string(),
            })
            .collect();
        let mut resolver = SourceResolver::new(projects, GZDOOM_DAP_LOCALE);
        resolver.install_index(
            sources
                .into_iter()
                .map(|(path, project)| (path.to_string(), project))
                .collect(),
        );
        resolver
    }

    // The concrete scenario: a stack-frame source reported as a relative path
    // plus origin tag becomes the canonical client path.
    #[test]
    fn test_relative_origin_to_client() {
        let mut resolver = resolver(vec![("/proj", "/proj")], vec![("/proj/src/a.zs", 0)]);
        let mut source = Source {
            path: Some("src/a.zs".into()),
            origin: Some("/proj".into()),
            ..Default::default()
        };
        resolver.to_client_source(&mut source);
        assert_eq!(source.path.as_deref(), Some("/proj/src/a.zs"));
        assert_eq!(source.name.as_deref(), Some("a.zs"));
        assert_eq!(source.source_reference, Some(0));
    }

    #[test]
    fn test_path_roundtrip() {
        let mut resolver = resolver(vec![("/proj", "myproj.pk3")], vec![("/proj/src/a.zs", 0)]);
        let mut source = Source {
            path: Some("/proj/src/a.zs".into()),
            ..Default::default()
        };
        resolver.to_debugger_source(&mut source);
        assert_eq!(source.path.as_deref(), Some("src/a.zs"));
        assert_eq!(source.origin.as_deref(), Some("myproj.pk3"));

        resolver.to_client_source(&mut source);
        assert!(source
            .path
            .as_deref()
            .unwrap()
            .eq_ignore_ascii_case("/proj/src/a.zs"));
    }

    #[test]
    fn test_longest_root_wins() {
        let resolver = resolver(vec![("/a", "outer"), ("/a/b", "inner")], vec![]);
        let mut source = Source {
            path: Some("/a/b/c.txt".into()),
            ..Default::default()
        };
        resolver.to_debugger_source(&mut source);
        assert_eq!(source.path.as_deref(), Some("c.txt"));
        assert_eq!(source.origin.as_deref(), Some("inner"));
    }

    #[test]
    fn test_unowned_path_stays_absolute() {
        let resolver = resolver(vec![("/proj", "/proj")], vec![]);
        let mut source = Source {
            path: Some("/elsewhere/b.zs".into()),
            ..Default::default()
        };
        resolver.to_debugger_source(&mut source);
        assert_eq!(source.path.as_deref(), Some("/elsewhere/b.zs"));
        assert_eq!(source.origin, None);
    }

    #[test]
    fn test_case_corrected_by_index() {
        let mut resolver = resolver(vec![("/proj", "/proj")], vec![("/proj/src/Actor.zs", 0)]);
        let mut source = Source {
            path: Some("SRC\\ACTOR.ZS".into()),
            origin: Some("/PROJ/".into()),
            ..Default::default()
        };
        resolver.to_client_source(&mut source);
        assert_eq!(source.path.as_deref(), Some("/proj/src/Actor.zs"));
        assert_eq!(source.name.as_deref(), Some("Actor.zs"));
    }

    // A server path we never scanned passes through uncorrected, but is
    // remembered so the next lookup resolves it.
    #[test]
    fn test_speculative_insert_no_rescan() {
        let mut resolver = resolver(vec![("/proj", "/proj")], vec![]);
        let mut source = Source {
            path: Some("src/new.zs".into()),
            origin: Some("/proj".into()),
            ..Default::default()
        };
        resolver.to_client_source(&mut source);
        assert_eq!(source.path.as_deref(), Some("src/new.zs"));

        let mut again = Source {
            path: Some("src/new.zs".into()),
            origin: Some("/proj".into()),
            ..Default::default()
        };
        resolver.to_client_source(&mut again);
        assert_eq!(again.path.as_deref(), Some("/proj/src/new.zs"));
    }

    #[test]
    fn test_sourceless_passthrough() {
        let mut resolver = resolver(vec![("/proj", "/proj")], vec![]);
        let mut source = Source {
            source_reference: Some(1234),
            ..Default::default()
        };
        resolver.to_client_source(&mut source);
        assert_eq!(source.source_reference, Some(1234));
        resolver.to_debugger_source(&mut source);
        assert_eq!(source.path, None);
    }

    #[test]
    fn test_project_sources() {
        let resolver = resolver(
            vec![("/proj", "proj.pk3")],
            vec![("/proj/src/a.zs", 0), ("/proj/DECORATE", 0)],
        );
        let sources = resolver.project_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].path.as_deref(), Some("DECORATE"));
        assert_eq!(sources[0].origin.as_deref(), Some("proj.pk3"));
        assert_eq!(sources[1].path.as_deref(), Some("src/a.zs"));
        assert_eq!(sources[1].name.as_deref(), Some("a.zs"));
    }

    #[test]
    fn test_line_conversion() {
        let mut resolver = resolver(vec![], vec![]);
        let mut caps = ClientCapabilities::default();
        caps.lines_start_at1 = false;
        caps.columns_start_at1 = false;
        resolver.set_client_capabilities(caps);
        // Debugger locale is 1-based, client is 0-based.
        assert_eq!(resolver.convert_client_line_to_debugger(0), 1);
        assert_eq!(resolver.convert_debugger_line_to_client(1), 0);
        assert_eq!(resolver.convert_client_column_to_debugger(4), 5);
        assert_eq!(resolver.convert_debugger_column_to_client(5), 4);
    }

    #[test]
    fn test_uri_conversion() {
        let mut resolver = resolver(vec![("/proj", "/proj")], vec![("/proj/src/a file.zs", 0)]);
        let mut caps = ClientCapabilities::default();
        caps.paths_are_uris = true;
        resolver.set_client_capabilities(caps);

        let mut source = Source {
            path: Some("file:///proj/src/a%20file.zs".into()),
            ..Default::default()
        };
        resolver.to_debugger_source(&mut source);
        assert_eq!(source.path.as_deref(), Some("src/a file.zs"));

        resolver.to_client_source(&mut source);
        assert_eq!(source.path.as_deref(), Some("file:///proj/src/a%20file.zs"));
    }
}
