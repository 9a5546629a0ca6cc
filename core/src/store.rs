//! Resumable on-disk cache of validated translations.
//!
//! One JSON file per document maps each [`TagKey::entry_key`] to its
//! translated fragments. Files are only ever rewritten through [`crate::backup::swap_in`]
//! and only by the save worker that owns the [`Store`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::backup::{quarantine, swap_in, BackupError};
use crate::codec::{join_fragments, split_fragments};
use crate::document::TagKey;

/// Translated fragments keyed by `tag_path#index`.
pub type DocumentEntries = BTreeMap<String, Vec<String>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("store serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Backup(#[from] BackupError),
}

pub struct Store {
    root: PathBuf,
    documents: HashMap<String, DocumentEntries>,
    quarantined: Vec<PathBuf>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
            documents: HashMap::new(),
            quarantined: Vec::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<safe name>_<first 8 hex digits of sha256(document id)>.json`
    pub fn path_for(&self, document_id: &str) -> PathBuf {
        let safe_name: String = document_id
            .chars()
            .filter(|c| *c != ':')
            .map(|c| if c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let digest = hex::encode(Sha256::digest(document_id.as_bytes()));
        self.root.join(format!("{safe_name}_{}.json", &digest[..8]))
    }

    /// Files moved aside because they could not be parsed.
    pub fn quarantined(&self) -> &[PathBuf] {
        &self.quarantined
    }

    fn document(&mut self, document_id: &str) -> Result<&mut DocumentEntries, StoreError> {
        if !self.documents.contains_key(document_id) {
            let path = self.path_for(document_id);
            let entries = match fs::read_to_string(&path) {
                Ok(raw) => match serde_json::from_str::<DocumentEntries>(&raw) {
                    Ok(entries) => entries,
                    Err(err) => {
                        let backup = quarantine(&path)?;
                        log::warn!(
                            "corrupt cache file {} ({err}); moved to {}",
                            path.display(),
                            backup.display()
                        );
                        self.quarantined.push(backup);
                        DocumentEntries::new()
                    }
                },
                Err(err) if err.kind() == io::ErrorKind::NotFound => DocumentEntries::new(),
                Err(err) => return Err(err.into()),
            };
            self.documents.insert(document_id.to_string(), entries);
        }
        Ok(self.documents.entry(document_id.to_string()).or_default())
    }

    pub fn entries(&mut self, document_id: &str) -> Result<&DocumentEntries, StoreError> {
        self.document(document_id).map(|entries| &*entries)
    }

    pub fn get(&mut self, key: &TagKey) -> Result<Option<Vec<String>>, StoreError> {
        Ok(self.document(&key.document_id)?.get(&key.entry_key()).cloned())
    }

    /// Stored fragments joined back with the fragment separator.
    pub fn get_text(&mut self, key: &TagKey) -> Result<Option<String>, StoreError> {
        Ok(self.get(key)?.map(|fragments| join_fragments(&fragments)))
    }

    pub fn contains(&mut self, key: &TagKey) -> Result<bool, StoreError> {
        Ok(self.document(&key.document_id)?.contains_key(&key.entry_key()))
    }

    /// Merges `entries` (key, translated line) into their document files.
    ///
    /// Returns `false`, without touching the disk, when every entry is
    /// already stored with identical fragments.
    pub fn save<'a, I>(&mut self, entries: I) -> Result<bool, StoreError>
    where
        I: IntoIterator<Item = (&'a TagKey, &'a str)>,
    {
        let mut touched = BTreeSet::new();
        for (key, translated) in entries {
            let fragments: Vec<String> = split_fragments(translated)
                .into_iter()
                .map(str::to_string)
                .collect();
            let document = self.document(&key.document_id)?;
            let entry = key.entry_key();
            if document.get(&entry) != Some(&fragments) {
                document.insert(entry, fragments);
                touched.insert(key.document_id.clone());
            }
        }

        for document_id in &touched {
            self.flush(document_id)?;
        }
        Ok(!touched.is_empty())
    }

    fn flush(&mut self, document_id: &str) -> Result<(), StoreError> {
        let path = self.path_for(document_id);
        let json = serde_json::to_vec_pretty(&*self.document(document_id)?)?;
        swap_in(&path, &json)?;
        Ok(())
    }

    pub fn clear(&mut self, document_id: &str) -> Result<(), StoreError> {
        self.documents.remove(document_id);
        match fs::remove_file(self.path_for(document_id)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    /// Deletes every cache file under the store root.
    pub fn clear_all(&mut self) -> Result<(), StoreError> {
        self.documents.clear();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().map(|ext| ext == "json").unwrap_or(false) {
                fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Initial,
    Refined,
}

impl Phase {
    pub fn label(&self) -> &'static str {
        match self {
            Phase::Initial => "initial",
            Phase::Refined => "refined",
        }
    }
}

/// First-pass and refinement stores under one cache directory.
pub struct PhaseStores {
    initial: Store,
    refined: Store,
}

impl PhaseStores {
    pub fn open<P: AsRef<Path>>(cache_dir: P) -> Result<Self, StoreError> {
        Ok(Self {
            initial: Store::open(cache_dir.as_ref().join(Phase::Initial.label()))?,
            refined: Store::open(cache_dir.as_ref().join(Phase::Refined.label()))?,
        })
    }

    pub fn store(&mut self, phase: Phase) -> &mut Store {
        match phase {
            Phase::Initial => &mut self.initial,
            Phase::Refined => &mut self.refined,
        }
    }

    /// Refined translation when present, otherwise the initial one.
    pub fn best_text(&mut self, key: &TagKey) -> Result<Option<(Phase, String)>, StoreError> {
        if let Some(text) = self.refined.get_text(key)? {
            return Ok(Some((Phase::Refined, text)));
        }
        Ok(self.initial.get_text(key)?.map(|text| (Phase::Initial, text)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(document: &str, index: usize) -> TagKey {
        TagKey::new(document, "body/p", index)
    }

    #[test]
    fn file_name_is_safe_and_stable() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let path = store.path_for("OEBPS/Text/ch1.xhtml");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("OEBPS_Text_ch1.xhtml_"));
        assert!(name.ends_with(".json"));
        assert_eq!(name.len(), "OEBPS_Text_ch1.xhtml_".len() + 8 + ".json".len());
        assert_eq!(path, store.path_for("OEBPS/Text/ch1.xhtml"));
    }

    #[test]
    fn saves_fragments_and_survives_reopen() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        assert!(store
            .save([(&key("ch1.xhtml", 0), "Bonjour</>le monde"), (&key("ch1.xhtml", 1), "Fin")])
            .unwrap());

        let mut reopened = Store::open(dir.path()).unwrap();
        assert_eq!(
            reopened.get(&key("ch1.xhtml", 0)).unwrap(),
            Some(vec!["Bonjour".to_string(), "le monde".to_string()])
        );
        assert_eq!(
            reopened.get_text(&key("ch1.xhtml", 0)).unwrap().as_deref(),
            Some("Bonjour</>le monde")
        );
        assert!(!reopened.contains(&key("ch1.xhtml", 2)).unwrap());
    }

    #[test]
    fn identical_save_is_a_no_op() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        assert!(store.save([(&key("ch1.xhtml", 0), "Bonjour")]).unwrap());
        assert!(!store.save([(&key("ch1.xhtml", 0), "Bonjour")]).unwrap());
        assert_eq!(store.entries("ch1.xhtml").unwrap().len(), 1);
        assert!(store.save([(&key("ch1.xhtml", 0), "Salut")]).unwrap());
    }

    #[test]
    fn corrupt_file_is_quarantined() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let path = store.path_for("ch1.xhtml");
        fs::write(&path, "{\"0\": [\"Bonj").unwrap();

        assert_eq!(store.get(&key("ch1.xhtml", 0)).unwrap(), None);
        assert_eq!(store.quarantined().len(), 1);
        assert!(store.quarantined()[0].exists());

        assert!(store.save([(&key("ch1.xhtml", 0), "Bonjour")]).unwrap());
        assert!(path.exists());
    }

    #[test]
    fn clear_removes_documents() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        store.save([(&key("a.xhtml", 0), "A")]).unwrap();
        store.save([(&key("b.xhtml", 0), "B")]).unwrap();

        store.clear("a.xhtml").unwrap();
        assert!(!store.path_for("a.xhtml").exists());
        store.clear_all().unwrap();
        assert!(!store.path_for("b.xhtml").exists());
        assert!(!store.contains(&key("b.xhtml", 0)).unwrap());
    }

    #[test]
    fn refined_translation_wins() {
        let dir = tempdir().unwrap();
        let mut stores = PhaseStores::open(dir.path()).unwrap();
        stores.store(Phase::Initial).save([(&key("ch1.xhtml", 0), "Bonjour"), (&key("ch1.xhtml", 1), "Monde")]).unwrap();
        stores.store(Phase::Refined).save([(&key("ch1.xhtml", 0), "Salut")]).unwrap();

        assert_eq!(
            stores.best_text(&key("ch1.xhtml", 0)).unwrap(),
            Some((Phase::Refined, "Salut".to_string()))
        );
        assert_eq!(
            stores.best_text(&key("ch1.xhtml", 1)).unwrap(),
            Some((Phase::Initial, "Monde".to_string()))
        );
        assert_eq!(stores.best_text(&key("ch1.xhtml", 2)).unwrap(), None);
    }

    #[test]
    fn same_index_under_different_tag_paths_stays_separate() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        let title = TagKey::new("ch1.xhtml", "body/h1", 0);
        store.save([(&title, "Titre")]).unwrap();

        assert_eq!(store.get_text(&key("ch1.xhtml", 0)).unwrap(), None);
        assert!(!store.contains(&key("ch1.xhtml", 0)).unwrap());

        store.save([(&key("ch1.xhtml", 0), "Paragraphe")]).unwrap();
        assert_eq!(store.get_text(&title).unwrap().as_deref(), Some("Titre"));
        assert_eq!(store.entries("ch1.xhtml").unwrap().len(), 2);
    }

    #[test]
    fn one_save_can_span_documents() {
        let dir = tempdir().unwrap();
        let mut store = Store::open(dir.path()).unwrap();
        assert!(store
            .save([(&key("a.xhtml", 0), "A"), (&key("b.xhtml", 0), "B")])
            .unwrap());
        assert!(store.path_for("a.xhtml").exists());
        assert!(store.path_for("b.xhtml").exists());
    }
}
