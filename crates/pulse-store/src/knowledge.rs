//! Knowledge store
//!
//! Per-guest notes learned during chat sessions, patrols and discovery. One
//! file per guest under `<data_dir>/knowledge/`: `<id>.enc` when the sealer is
//! available, `<id>.json` otherwise (and for files written before encryption
//! existed). Only the last path component of a guest id is ever used as a file
//! name.

use chrono::{DateTime, Utc};
use pulse_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::crypto::{create_private_dir, Sealer};

/// At most this many guests appear in the cross-guest context block
pub const MAX_CONTEXT_GUESTS: usize = 10;
/// Byte cap of the cross-guest context block
pub const MAX_CONTEXT_BYTES: usize = 8000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteCategory {
    Credential,
    Service,
    Path,
    Config,
    Learning,
    History,
    Infrastructure,
}

impl NoteCategory {
    /// Render order for context blocks
    pub const ORDER: [NoteCategory; 7] = [
        NoteCategory::Credential,
        NoteCategory::Service,
        NoteCategory::Path,
        NoteCategory::Config,
        NoteCategory::Learning,
        NoteCategory::History,
        NoteCategory::Infrastructure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NoteCategory::Credential => "credential",
            NoteCategory::Service => "service",
            NoteCategory::Path => "path",
            NoteCategory::Config => "config",
            NoteCategory::Learning => "learning",
            NoteCategory::History => "history",
            NoteCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            NoteCategory::Credential => "Credentials",
            NoteCategory::Service => "Services",
            NoteCategory::Path => "Important Paths",
            NoteCategory::Config => "Configuration",
            NoteCategory::Learning => "Learnings",
            NoteCategory::History => "Session History",
            NoteCategory::Infrastructure => "Discovered Infrastructure",
        }
    }
}

impl fmt::Display for NoteCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NoteCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        NoteCategory::ORDER
            .into_iter()
            .find(|c| c.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| Error::invalid_input(format!("unknown note category: {}", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub category: NoteCategory,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GuestKnowledge {
    pub guest_id: String,
    #[serde(default)]
    pub guest_name: String,
    /// `vm`, `container`, `node` or `host`
    #[serde(default)]
    pub guest_type: String,
    #[serde(default)]
    pub notes: Vec<Note>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl GuestKnowledge {
    fn empty(guest_id: &str) -> Self {
        Self {
            guest_id: guest_id.to_string(),
            ..Default::default()
        }
    }

    fn display_name<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.guest_name.is_empty() {
            fallback
        } else {
            &self.guest_name
        }
    }
}

pub struct KnowledgeStore {
    dir: PathBuf,
    sealer: Option<Sealer>,
    /// Keyed by file stem
    cache: RwLock<HashMap<String, GuestKnowledge>>,
}

impl KnowledgeStore {
    /// Open the store under `<data_dir>/knowledge`. A sealer failure degrades
    /// to plaintext files with a warning.
    pub fn new(data_dir: &Path) -> Result<Self> {
        let sealer = match Sealer::new(data_dir) {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "Failed to initialize crypto for knowledge store, data will be unencrypted");
                None
            }
        };
        Self::with_sealer(data_dir, sealer)
    }

    pub fn with_sealer(data_dir: &Path, sealer: Option<Sealer>) -> Result<Self> {
        let dir = data_dir.join("knowledge");
        create_private_dir(&dir)?;
        Ok(Self {
            dir,
            sealer,
            cache: RwLock::new(HashMap::new()),
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.sealer.is_some()
    }

    fn stem(guest_id: &str) -> Result<String> {
        Path::new(guest_id.trim())
            .file_name()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .map(String::from)
            .ok_or_else(|| Error::invalid_input(format!("invalid guest id: {:?}", guest_id)))
    }

    fn primary_path(&self, stem: &str) -> PathBuf {
        let ext = if self.sealer.is_some() { "enc" } else { "json" };
        self.dir.join(format!("{}.{}", stem, ext))
    }

    fn legacy_path(&self, stem: &str) -> PathBuf {
        self.dir.join(format!("{}.json", stem))
    }

    /// Knowledge for a guest; a guest with no file yields an empty record
    pub async fn get(&self, guest_id: &str) -> Result<GuestKnowledge> {
        let stem = Self::stem(guest_id)?;
        if let Some(cached) = self.cache.read().await.get(&stem) {
            return Ok(cached.clone());
        }

        let mut cache = self.cache.write().await;
        if let Some(cached) = cache.get(&stem) {
            return Ok(cached.clone());
        }
        let knowledge = self.load(guest_id, &stem).await?;
        cache.insert(stem, knowledge.clone());
        Ok(knowledge)
    }

    async fn load(&self, guest_id: &str, stem: &str) -> Result<GuestKnowledge> {
        let primary = self.primary_path(stem);
        match tokio::fs::read(&primary).await {
            Ok(data) => return self.decode(guest_id, &primary, data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let legacy = self.legacy_path(stem);
        if legacy == primary {
            return Ok(GuestKnowledge::empty(guest_id));
        }
        match tokio::fs::read(&legacy).await {
            Ok(data) => {
                info!(guest_id = %guest_id, "Found unencrypted knowledge file, will encrypt on next save");
                Ok(serde_json::from_slice(&data)?)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(GuestKnowledge::empty(guest_id)),
            Err(e) => Err(e.into()),
        }
    }

    fn decode(&self, guest_id: &str, path: &Path, data: Vec<u8>) -> Result<GuestKnowledge> {
        let is_enc = path.extension().map(|e| e == "enc").unwrap_or(false);
        let sealer = match (&self.sealer, is_enc) {
            (Some(s), true) => s,
            _ => return Ok(serde_json::from_slice(&data)?),
        };

        match sealer.decrypt(&data) {
            Ok(plain) => Ok(serde_json::from_slice(&plain)?),
            Err(decrypt_err) => match serde_json::from_slice::<GuestKnowledge>(&data) {
                Ok(k) => {
                    info!(guest_id = %guest_id, "Loaded unencrypted knowledge (will encrypt on next save)");
                    Ok(k)
                }
                Err(_) => Err(Error::internal(format!(
                    "failed to decrypt knowledge: {}",
                    decrypt_err
                ))),
            },
        }
    }

    /// Add a note, or update the content of the note with the same
    /// `(category, title)` in place
    pub async fn save_note(
        &self,
        guest_id: &str,
        guest_name: &str,
        guest_type: &str,
        category: NoteCategory,
        title: &str,
        content: &str,
    ) -> Result<()> {
        let stem = Self::stem(guest_id)?;
        let mut cache = self.cache.write().await;
        let mut knowledge = match cache.get(&stem) {
            Some(k) => k.clone(),
            None => self.load(guest_id, &stem).await.unwrap_or_else(|e| {
                warn!(guest_id = %guest_id, error = %e, "Failed to parse existing knowledge, starting fresh");
                GuestKnowledge::empty(guest_id)
            }),
        };

        if knowledge.guest_id.is_empty() {
            knowledge.guest_id = guest_id.to_string();
        }
        if !guest_name.is_empty() {
            knowledge.guest_name = guest_name.to_string();
        }
        if !guest_type.is_empty() {
            knowledge.guest_type = guest_type.to_string();
        }

        let now = Utc::now();
        match knowledge
            .notes
            .iter_mut()
            .find(|n| n.category == category && n.title == title)
        {
            Some(note) => {
                note.content = content.to_string();
                note.updated_at = now;
            }
            None => {
                let id = next_note_id(&knowledge.notes, category);
                knowledge.notes.push(Note {
                    id,
                    category,
                    title: title.to_string(),
                    content: content.to_string(),
                    created_at: now,
                    updated_at: now,
                });
            }
        }
        knowledge.updated_at = Some(now);

        self.write(&stem, &knowledge).await?;
        cache.insert(stem, knowledge);
        Ok(())
    }

    pub async fn delete_note(&self, guest_id: &str, note_id: &str) -> Result<()> {
        let stem = Self::stem(guest_id)?;
        let mut cache = self.cache.write().await;
        let mut knowledge = match cache.get(&stem) {
            Some(k) => k.clone(),
            None => {
                let loaded = self.load(guest_id, &stem).await?;
                if loaded.notes.is_empty() {
                    return Err(Error::not_found(format!("guest not found: {}", guest_id)));
                }
                loaded
            }
        };

        let before = knowledge.notes.len();
        knowledge.notes.retain(|n| n.id != note_id);
        if knowledge.notes.len() == before {
            return Err(Error::not_found(format!("note not found: {}", note_id)));
        }
        knowledge.updated_at = Some(Utc::now());

        self.write(&stem, &knowledge).await?;
        cache.insert(stem, knowledge);
        Ok(())
    }

    async fn write(&self, stem: &str, knowledge: &GuestKnowledge) -> Result<()> {
        let mut data = serde_json::to_vec_pretty(knowledge)?;
        if let Some(sealer) = &self.sealer {
            data = sealer
                .encrypt(&data)
                .map_err(|e| Error::internal(format!("failed to encrypt knowledge: {}", e)))?;
        }

        let path = self.primary_path(stem);
        write_private(&path, &data).await?;

        if self.sealer.is_some() {
            let legacy = self.legacy_path(stem);
            if tokio::fs::metadata(&legacy).await.is_ok() {
                tokio::fs::remove_file(&legacy).await?;
                info!(guest = %stem, "Removed legacy unencrypted knowledge file");
            }
        }

        debug!(
            guest = %stem,
            notes = knowledge.notes.len(),
            encrypted = self.sealer.is_some(),
            "Saved guest knowledge"
        );
        Ok(())
    }

    pub async fn notes_by_category(&self, guest_id: &str, category: NoteCategory) -> Result<Vec<Note>> {
        Ok(self
            .get(guest_id)
            .await?
            .notes
            .into_iter()
            .filter(|n| n.category == category)
            .collect())
    }

    /// File stems of every guest with stored knowledge
    pub async fn list_guests(&self) -> Result<Vec<String>> {
        let mut guests = BTreeSet::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some("json") | Some("enc")) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    guests.insert(stem.to_string());
                }
            }
        }
        Ok(guests.into_iter().collect())
    }

    /// Notes for one guest, grouped by category
    pub async fn format_for_context(&self, guest_id: &str) -> String {
        let knowledge = match self.get(guest_id).await {
            Ok(k) => k,
            Err(e) => {
                warn!(guest_id = %guest_id, error = %e, "Failed to load guest knowledge");
                return String::new();
            }
        };
        if knowledge.notes.is_empty() {
            return String::new();
        }

        let mut out = format!(
            "\n## Previously Learned Information about {}\n",
            knowledge.display_name(guest_id)
        );
        out.push_str("**If relevant to the current task, use this saved information directly instead of rediscovering it.**\n");

        for category in NoteCategory::ORDER {
            let notes: Vec<&Note> = knowledge.notes.iter().filter(|n| n.category == category).collect();
            if notes.is_empty() {
                continue;
            }
            out.push_str(&format!("\n### {}\n", category.display_name()));
            for note in notes {
                out.push_str(&format!("- **{}**: {}\n", note.title, note.content));
            }
        }
        out
    }

    /// Saved knowledge across all guests, newest first, bounded by
    /// [`MAX_CONTEXT_GUESTS`] and [`MAX_CONTEXT_BYTES`]
    pub async fn format_all_for_context(&self) -> String {
        let guests = match self.list_guests().await {
            Ok(g) => g,
            Err(_) => return String::new(),
        };
        self.format_guests(guests).await
    }

    /// Like [`format_all_for_context`](Self::format_all_for_context) but only
    /// for guests whose id shares a token with one of `resource_ids`
    pub async fn format_for_resources(&self, resource_ids: &[String]) -> String {
        if resource_ids.is_empty() {
            return String::new();
        }
        let wanted = resource_tokens(resource_ids.iter().map(String::as_str));
        if wanted.is_empty() {
            return String::new();
        }
        let guests = match self.list_guests().await {
            Ok(g) => g,
            Err(_) => return String::new(),
        };
        let matching = guests
            .into_iter()
            .filter(|g| resource_tokens([g.as_str()]).iter().any(|t| wanted.contains(t)))
            .collect();
        self.format_guests(matching).await
    }

    async fn format_guests(&self, guest_ids: Vec<String>) -> String {
        let mut guests = Vec::new();
        for id in guest_ids {
            if let Ok(k) = self.get(&id).await {
                if k.notes.iter().any(|n| n.category != NoteCategory::History) {
                    guests.push((id, k));
                }
            }
        }
        if guests.is_empty() {
            return String::new();
        }
        guests.sort_by(|a, b| b.1.updated_at.cmp(&a.1.updated_at));

        let total_guests = guests.len();
        let total_notes: usize = guests
            .iter()
            .map(|(_, k)| k.notes.iter().filter(|n| n.category != NoteCategory::History).count())
            .sum();
        let truncated_guests = guests.len() > MAX_CONTEXT_GUESTS;
        guests.truncate(MAX_CONTEXT_GUESTS);

        let mut sections: Vec<String> = Vec::new();
        let mut included = 0usize;
        let mut used_bytes = 0usize;
        let mut hit_cap = false;

        'guests: for (id, knowledge) in &guests {
            let mut section = format!("\n### {} ({})", knowledge.display_name(id), knowledge.guest_type);
            let mut section_notes = 0usize;

            for category in NoteCategory::ORDER {
                if category == NoteCategory::History {
                    continue;
                }
                for note in knowledge.notes.iter().filter(|n| n.category == category) {
                    let content = if category == NoteCategory::Credential {
                        mask_credential(&note.content)
                    } else {
                        note.content.clone()
                    };
                    let line = format!("\n- **{}**: {}", note.title, content);

                    if used_bytes + section.len() + line.len() > MAX_CONTEXT_BYTES {
                        hit_cap = true;
                        if section_notes > 0 {
                            sections.push(section);
                        }
                        break 'guests;
                    }
                    section.push_str(&line);
                    section_notes += 1;
                    included += 1;
                }
            }

            used_bytes += section.len();
            sections.push(section);
        }

        if sections.is_empty() {
            return String::new();
        }

        let mut out = if truncated_guests || included < total_notes {
            if hit_cap {
                warn!(
                    total_notes,
                    included_notes = included,
                    total_guests,
                    max_bytes = MAX_CONTEXT_BYTES,
                    "Knowledge context truncated to prevent bloat - consider cleaning up old notes"
                );
            }
            format!(
                "\n\n## Saved Knowledge ({}/{} notes from {}/{} guests, most recent)\n",
                included,
                total_notes,
                sections.len(),
                total_guests
            )
        } else {
            format!(
                "\n\n## Saved Knowledge ({} notes across {} guests)\n",
                total_notes,
                sections.len()
            )
        };
        out.push_str("This is information learned from previous sessions. Use it to avoid rediscovery.\n");
        out.push_str(&sections.join("\n"));
        out
    }

    /// Discovered-infrastructure notes of every guest, for chat prompts
    pub async fn infrastructure_context(&self) -> String {
        let guests = match self.list_guests().await {
            Ok(g) if !g.is_empty() => g,
            _ => return String::new(),
        };

        let mut body = String::new();
        for id in guests {
            let Ok(knowledge) = self.get(&id).await else {
                continue;
            };
            let infra: Vec<&Note> = knowledge
                .notes
                .iter()
                .filter(|n| n.category == NoteCategory::Infrastructure)
                .collect();
            if infra.is_empty() {
                continue;
            }
            body.push_str(&format!("### {}\n", knowledge.display_name(&id)));
            for note in infra {
                body.push_str(&format!("- {}: {}\n", note.title, note.content));
            }
            body.push('\n');
        }

        if body.is_empty() {
            return String::new();
        }
        let mut out = String::from("\n## Discovered Infrastructure\n");
        out.push_str("The following services have been auto-discovered on your infrastructure.\n");
        out.push_str("Use this information to propose correct commands (e.g., use 'docker exec' for containerized services).\n\n");
        out.push_str(&body);
        out
    }
}

fn next_note_id(notes: &[Note], category: NoteCategory) -> String {
    let taken: HashSet<&str> = notes.iter().map(|n| n.id.as_str()).collect();
    let mut n = notes.len() + 1;
    loop {
        let id = format!("{}-{}", category, n);
        if !taken.contains(id.as_str()) {
            return id;
        }
        n += 1;
    }
}

/// `ab****yz` for secrets longer than six characters
pub fn mask_credential(content: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.len() <= 6 {
        return content.to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}****{}", head, tail)
}

/// Lowercased match tokens for resource ids: the id itself, its last `/` and
/// `:` segments, the id without a `vm-`/`ct-`/`lxc-` prefix, the trailing VMID
/// of guest-like ids, and the host and container of `kind:host/container` ids.
pub fn resource_tokens<'a>(ids: impl IntoIterator<Item = &'a str>) -> HashSet<String> {
    let mut tokens = HashSet::new();
    for id in ids {
        add_resource_tokens(&mut tokens, id);
    }
    tokens
}

fn add_resource_tokens(tokens: &mut HashSet<String>, id: &str) {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return;
    }
    add_token(tokens, trimmed);

    for sep in ['/', ':'] {
        if let Some((_, last)) = trimmed.rsplit_once(sep) {
            add_token(tokens, last);
        }
    }

    let lower = trimmed.to_lowercase();
    for prefix in ["vm-", "ct-", "lxc-"] {
        if lower.starts_with(prefix) {
            add_token(tokens, &trimmed[prefix.len()..]);
        }
    }

    let guest_like = lower.contains("qemu/")
        || lower.contains("lxc/")
        || lower.starts_with("vm-")
        || lower.starts_with("ct-");
    if guest_like {
        let digits: String = {
            let rev: Vec<char> = trimmed.chars().rev().take_while(|c| c.is_ascii_digit()).collect();
            rev.into_iter().rev().collect()
        };
        add_token(tokens, &digits);
    }

    if let Some((_, rest)) = trimmed.split_once(':') {
        if let Some((host, container)) = rest.split_once('/') {
            add_token(tokens, host);
            add_token(tokens, container);
        }
    }
}

fn add_token(tokens: &mut HashSet<String>, value: &str) {
    let t = value.trim();
    if !t.is_empty() {
        tokens.insert(t.to_lowercase());
    }
}

#[cfg(unix)]
async fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut f = tokio::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .await?;
    f.write_all(data).await?;
    f.flush().await
}

#[cfg(not(unix))]
async fn write_private(path: &Path, data: &[u8]) -> std::io::Result<()> {
    tokio::fs::write(path, data).await
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, KnowledgeStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KnowledgeStore::new(dir.path()).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_missing_guest_is_empty() {
        let (_dir, store) = store().await;
        let k = store.get("vm-404").await.unwrap();
        assert!(k.notes.is_empty());
        assert_eq!(k.guest_id, "vm-404");
    }

    #[tokio::test]
    async fn test_resave_same_title_updates_in_place() {
        let (_dir, store) = store().await;
        store
            .save_note("vm-100", "web", "vm", NoteCategory::Service, "nginx", "port 80")
            .await
            .unwrap();
        store
            .save_note("vm-100", "web", "vm", NoteCategory::Service, "nginx", "port 8080")
            .await
            .unwrap();

        let k = store.get("vm-100").await.unwrap();
        assert_eq!(k.notes.len(), 1);
        assert_eq!(k.notes[0].content, "port 8080");
        assert_eq!(k.notes[0].id, "service-1");
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = KnowledgeStore::new(dir.path()).unwrap();
            assert!(store.is_encrypted());
            store
                .save_note("vm-100", "web", "vm", NoteCategory::Credential, "root", "hunter2hunter2")
                .await
                .unwrap();
        }
        let on_disk = std::fs::read(dir.path().join("knowledge/vm-100.enc")).unwrap();
        assert!(!String::from_utf8_lossy(&on_disk).contains("hunter2"));

        // Fresh store, empty cache: must go through decrypt
        let store = KnowledgeStore::new(dir.path()).unwrap();
        let k = store.get("vm-100").await.unwrap();
        assert_eq!(k.guest_name, "web");
        assert_eq!(k.notes[0].content, "hunter2hunter2");
        assert_eq!(k.notes[0].category, NoteCategory::Credential);
    }

    #[tokio::test]
    async fn test_legacy_json_is_migrated_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let kdir = dir.path().join("knowledge");
        std::fs::create_dir_all(&kdir).unwrap();
        let legacy = GuestKnowledge {
            guest_id: "ct-200".into(),
            guest_name: "db".into(),
            guest_type: "container".into(),
            notes: vec![],
            updated_at: None,
        };
        std::fs::write(kdir.join("ct-200.json"), serde_json::to_vec(&legacy).unwrap()).unwrap();

        let store = KnowledgeStore::new(dir.path()).unwrap();
        assert_eq!(store.get("ct-200").await.unwrap().guest_name, "db");

        store
            .save_note("ct-200", "", "", NoteCategory::Path, "data", "/var/lib/postgresql")
            .await
            .unwrap();
        assert!(kdir.join("ct-200.enc").exists());
        assert!(!kdir.join("ct-200.json").exists());
    }

    #[tokio::test]
    async fn test_plaintext_in_enc_file_is_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnowledgeStore::new(dir.path()).unwrap();
        let plain = GuestKnowledge {
            guest_id: "vm-1".into(),
            guest_name: "plain".into(),
            ..Default::default()
        };
        std::fs::write(
            dir.path().join("knowledge/vm-1.enc"),
            serde_json::to_vec(&plain).unwrap(),
        )
        .unwrap();
        assert_eq!(store.get("vm-1").await.unwrap().guest_name, "plain");
    }

    #[tokio::test]
    async fn test_garbage_enc_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let store = KnowledgeStore::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("knowledge/vm-2.enc"), b"not json, not sealed").unwrap();
        let err = store.get("vm-2").await.unwrap_err();
        assert!(err.to_string().contains("failed to decrypt knowledge"));
    }

    #[tokio::test]
    async fn test_path_traversal_uses_base_name() {
        let (dir, store) = store().await;
        store
            .save_note("../../etc/passwd", "x", "vm", NoteCategory::Learning, "t", "c")
            .await
            .unwrap();
        assert!(dir.path().join("knowledge/passwd.enc").exists());
    }

    #[tokio::test]
    async fn test_delete_note() {
        let (_dir, store) = store().await;
        store
            .save_note("vm-1", "a", "vm", NoteCategory::Learning, "t1", "c1")
            .await
            .unwrap();
        assert!(store.delete_note("vm-1", "learning-9").await.is_err());
        store.delete_note("vm-1", "learning-1").await.unwrap();
        assert!(store.get("vm-1").await.unwrap().notes.is_empty());
        let err = store.delete_note("vm-unknown", "x").await.unwrap_err();
        assert!(err.to_string().contains("guest not found"));
    }

    #[tokio::test]
    async fn test_format_for_context_orders_categories() {
        let (_dir, store) = store().await;
        store
            .save_note("vm-1", "web", "vm", NoteCategory::Learning, "tip", "restart nginx after cert renew")
            .await
            .unwrap();
        store
            .save_note("vm-1", "web", "vm", NoteCategory::Service, "nginx", "reverse proxy")
            .await
            .unwrap();
        let ctx = store.format_for_context("vm-1").await;
        assert!(ctx.contains("## Previously Learned Information about web"));
        let services = ctx.find("### Services").unwrap();
        let learnings = ctx.find("### Learnings").unwrap();
        assert!(services < learnings);
    }

    #[tokio::test]
    async fn test_format_all_masks_credentials_and_skips_history() {
        let (_dir, store) = store().await;
        store
            .save_note("vm-1", "web", "vm", NoteCategory::Credential, "db", "supersecret")
            .await
            .unwrap();
        store
            .save_note("vm-1", "web", "vm", NoteCategory::History, "chat", "talked about x")
            .await
            .unwrap();
        let ctx = store.format_all_for_context().await;
        assert!(ctx.contains("## Saved Knowledge (1 notes across 1 guests)"));
        assert!(ctx.contains("su****et"));
        assert!(!ctx.contains("supersecret"));
        assert!(!ctx.contains("talked about"));
    }

    #[tokio::test]
    async fn test_format_all_truncates_to_ten_guests() {
        let (_dir, store) = store().await;
        for i in 0..12 {
            store
                .save_note(&format!("vm-{}", i), &format!("g{}", i), "vm", NoteCategory::Service, "svc", "x")
                .await
                .unwrap();
        }
        let ctx = store.format_all_for_context().await;
        assert!(ctx.contains("## Saved Knowledge (10/12 notes from 10/12 guests, most recent)"));
        // Most recently updated guest wins a slot
        assert!(ctx.contains("### g11 (vm)"));
    }

    #[tokio::test]
    async fn test_format_all_first_note_over_cap_is_empty() {
        let (_dir, store) = store().await;
        let huge = "x".repeat(MAX_CONTEXT_BYTES + 1);
        store
            .save_note("vm-1", "web", "vm", NoteCategory::Learning, "big", &huge)
            .await
            .unwrap();
        assert_eq!(store.format_all_for_context().await, "");
    }

    #[tokio::test]
    async fn test_format_for_resources_matches_tokens() {
        let (_dir, store) = store().await;
        store
            .save_note("vm-101", "web", "vm", NoteCategory::Service, "nginx", "80")
            .await
            .unwrap();
        store
            .save_note("ct-202", "db", "container", NoteCategory::Service, "pg", "5432")
            .await
            .unwrap();

        let ctx = store
            .format_for_resources(&["pve1:node1/qemu/101".to_string()])
            .await;
        assert!(ctx.contains("### web (vm)"));
        assert!(!ctx.contains("### db"));
    }

    #[test]
    fn test_resource_tokens() {
        let t = resource_tokens(["docker:host1/nginx"]);
        assert!(t.contains("docker:host1/nginx"));
        assert!(t.contains("nginx"));
        assert!(t.contains("host1"));

        let t = resource_tokens(["VM-105"]);
        assert!(t.contains("105"));
        assert!(t.contains("vm-105"));

        let t = resource_tokens(["pve/lxc/300"]);
        assert!(t.contains("300"));
    }

    #[test]
    fn test_mask_credential() {
        assert_eq!(mask_credential("abc"), "abc");
        assert_eq!(mask_credential("abcdef"), "abcdef");
        assert_eq!(mask_credential("abcdefg"), "ab****fg");
    }
}
