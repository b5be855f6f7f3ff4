mod parser;

pub use parser::{parse_fragment, parse_template};

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use crate::error::{SynthError, SynthResult};
use crate::models::{ComplianceFragment, Template};

pub const TEMPLATES_DIR: &str = "templates";
pub const FRAGMENTS_DIR: &str = "fragments";
pub const TEMPLATE_EXT: &str = "tmpl";
pub const FRAGMENT_EXT: &str = "frag";

/// Catalog is an immutable snapshot of every template and fragment
#[derive(Debug)]
pub struct Catalog {
    generation: u64,
    loaded_at: DateTime<Utc>,
    root: PathBuf,
    templates: BTreeMap<String, Arc<Template>>,
    fragments: BTreeMap<String, Arc<ComplianceFragment>>,
}

impl Catalog {
    /// Build a catalog from already-parsed entries, checking cross references
    pub fn from_parts(
        root: impl Into<PathBuf>,
        generation: u64,
        templates: Vec<Template>,
        fragments: Vec<ComplianceFragment>,
    ) -> SynthResult<Self> {
        let root = root.into();

        let mut fragment_map: BTreeMap<String, Arc<ComplianceFragment>> = BTreeMap::new();
        for fragment in fragments {
            if let Some(existing) = fragment_map.get(&fragment.id) {
                return Err(duplicate_id("fragment", &fragment.id, &fragment.source, &existing.source));
            }
            fragment_map.insert(fragment.id.clone(), Arc::new(fragment));
        }

        let mut template_map: BTreeMap<String, Arc<Template>> = BTreeMap::new();
        for template in templates {
            if let Some(existing) = template_map.get(&template.id) {
                return Err(duplicate_id("template", &template.id, &template.source, &existing.source));
            }
            // Default fragments must exist and fit the template's family
            for name in &template.default_fragments {
                let fragment = fragment_map
                    .get(name)
                    .ok_or_else(|| SynthError::not_found("fragment", name.clone()))?;
                if !template.family.allows(&fragment.target) {
                    return Err(SynthError::UnknownSection {
                        section: fragment.target.clone(),
                        referenced_by: format!("fragment {} (default of template {})", name, template.id),
                    });
                }
            }
            template_map.insert(template.id.clone(), Arc::new(template));
        }

        Ok(Self {
            generation,
            loaded_at: Utc::now(),
            root,
            templates: template_map,
            fragments: fragment_map,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn template_ids(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }

    pub fn fragment_ids(&self) -> impl Iterator<Item = &str> {
        self.fragments.keys().map(String::as_str)
    }

    /// Look up a template by id
    pub fn resolve(&self, template_id: &str) -> SynthResult<Arc<Template>> {
        self.templates
            .get(template_id)
            .cloned()
            .ok_or_else(|| SynthError::not_found("template", template_id))
    }

    /// Look up fragments by name, in the order given.
    /// Fails if any name is unknown; there is no partial result.
    pub fn resolve_fragments<S: AsRef<str>>(&self, names: &[S]) -> SynthResult<Vec<Arc<ComplianceFragment>>> {
        let missing: Vec<&str> = names
            .iter()
            .map(AsRef::as_ref)
            .filter(|n| !self.fragments.contains_key(*n))
            .collect();
        if !missing.is_empty() {
            return Err(SynthError::not_found("fragment", missing.join(", ")));
        }
        Ok(names
            .iter()
            .filter_map(|n| self.fragments.get(n.as_ref()).cloned())
            .collect())
    }
}

fn duplicate_id(kind: &str, id: &str, path: &Path, first: &Path) -> SynthError {
    SynthError::CatalogParse {
        path: path.to_path_buf(),
        line: 0,
        message: format!("duplicate {} id {:?} (first defined in {})", kind, id, first.display()),
    }
}

/// List files with the given extension, sorted by name
fn list_files(dir: &Path, ext: &str) -> SynthResult<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|source| SynthError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| SynthError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(ext) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn read_file(path: &Path) -> SynthResult<String> {
    std::fs::read_to_string(path).map_err(|source| SynthError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_generation(root: &Path, generation: u64) -> SynthResult<Catalog> {
    let templates = list_files(&root.join(TEMPLATES_DIR), TEMPLATE_EXT)?
        .iter()
        .map(|path| parse_template(path, &read_file(path)?))
        .collect::<SynthResult<Vec<_>>>()?;

    // A catalog without fragments is valid
    let fragments_dir = root.join(FRAGMENTS_DIR);
    let fragment_files = if fragments_dir.is_dir() {
        list_files(&fragments_dir, FRAGMENT_EXT)?
    } else {
        Vec::new()
    };
    let fragments = fragment_files
        .iter()
        .map(|path| parse_fragment(path, &read_file(path)?))
        .collect::<SynthResult<Vec<_>>>()?;

    let catalog = Catalog::from_parts(root, generation, templates, fragments)?;
    tracing::info!(
        "Loaded catalog generation {} from {} ({} templates, {} fragments)",
        catalog.generation,
        root.display(),
        catalog.templates.len(),
        catalog.fragments.len()
    );
    Ok(catalog)
}

/// Load and fully parse a catalog directory holding `templates/*.tmpl` and
/// `fragments/*.frag`. Syntax problems surface here, never during synthesis.
pub fn load_catalog(path: impl AsRef<Path>) -> SynthResult<Catalog> {
    load_generation(path.as_ref(), 1)
}

/// CatalogHandle owns the current catalog snapshot and swaps it on reload.
/// Readers take an `Arc` and keep using it even if a reload happens mid-request.
#[derive(Debug)]
pub struct CatalogHandle {
    root: PathBuf,
    current: RwLock<Arc<Catalog>>,
    reload_lock: Mutex<()>,
}

impl CatalogHandle {
    pub fn open(path: impl Into<PathBuf>) -> SynthResult<Self> {
        let root = path.into();
        let catalog = load_catalog(&root)?;
        Ok(Self::new(catalog))
    }

    pub fn new(catalog: Catalog) -> Self {
        Self {
            root: catalog.root.clone(),
            current: RwLock::new(Arc::new(catalog)),
            reload_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The catalog in effect right now
    pub fn snapshot(&self) -> Arc<Catalog> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Re-read the catalog directory and swap it in.
    /// On any error the previous catalog stays in effect.
    pub fn reload(&self) -> SynthResult<Arc<Catalog>> {
        // Single writer: concurrent reloads queue up here
        let _guard = self.reload_lock.lock().unwrap_or_else(|e| e.into_inner());

        let next_generation = self.snapshot().generation + 1;
        let catalog = match load_generation(&self.root, next_generation) {
            Ok(c) => Arc::new(c),
            Err(e) => {
                tracing::warn!("Catalog reload failed, keeping generation {}: {}", next_generation - 1, e);
                return Err(e);
            }
        };

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = catalog.clone();
        Ok(catalog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    struct TempCatalog(tempfile::TempDir);

    impl TempCatalog {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join(TEMPLATES_DIR)).unwrap();
            std::fs::create_dir_all(dir.path().join(FRAGMENTS_DIR)).unwrap();
            Self(dir)
        }

        fn path(&self) -> &Path {
            self.0.path()
        }

        fn write(&self, rel: &str, content: &str) {
            std::fs::write(self.path().join(rel), content).unwrap();
        }
    }

    const TOWER: &str = "@version 1\n@family tower\n@fragments ssh\n[identity]\n/system identity set name={{device_name}}\n";
    const SSH: &str = "@version 1\n@target firewall-nat\n/ip firewall nat add chain=dstnat dst-port=22 action=redirect to-ports=2200\n";

    #[test]
    fn test_load_and_resolve() {
        let dir = TempCatalog::new();
        dir.write("templates/tower.tmpl", TOWER);
        dir.write("fragments/ssh.frag", SSH);

        let catalog = load_catalog(dir.path()).unwrap();
        assert_eq!(catalog.generation(), 1);
        assert_eq!(catalog.template_ids().collect::<Vec<_>>(), vec!["tower"]);
        assert_eq!(catalog.resolve("tower").unwrap().version, 1);
        assert!(matches!(catalog.resolve("edge"), Err(SynthError::NotFound { resource: "template", .. })));

        let err = catalog.resolve_fragments(&["ssh", "nope", "gone"]).unwrap_err();
        assert_eq!(err.to_string(), "fragment not found: nope, gone");
        assert_eq!(catalog.resolve_fragments(&["ssh"]).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_default_fragment_fails_load() {
        let dir = TempCatalog::new();
        dir.write("templates/tower.tmpl", TOWER);
        assert!(matches!(load_catalog(dir.path()), Err(SynthError::NotFound { .. })));
    }

    #[test]
    fn test_duplicate_template_id() {
        let dir = TempCatalog::new();
        dir.write("templates/tower.tmpl", TOWER);
        dir.write("templates/tower-copy.tmpl", &format!("@id tower\n{}", TOWER));
        dir.write("fragments/ssh.frag", SSH);
        assert!(matches!(load_catalog(dir.path()), Err(SynthError::CatalogParse { .. })));
    }

    #[test]
    fn test_reload_swaps_and_keeps_old_on_error() {
        let dir = TempCatalog::new();
        dir.write("templates/tower.tmpl", TOWER);
        dir.write("fragments/ssh.frag", SSH);

        let handle = CatalogHandle::open(dir.path()).unwrap();
        let before = handle.snapshot();

        dir.write("templates/tower.tmpl", &TOWER.replace("@version 1", "@version 2"));
        let after = handle.reload().unwrap();
        assert_eq!(after.generation(), 2);
        assert_eq!(after.resolve("tower").unwrap().version, 2);
        // Old snapshot is untouched
        assert_eq!(before.resolve("tower").unwrap().version, 1);

        dir.write("templates/broken.tmpl", "@family nowhere\n");
        assert!(handle.reload().is_err());
        assert_eq!(handle.snapshot().generation(), 2);
    }
}
