//! Skill descriptor registry.
//!
//! Skills are markdown documents that transports surface to users and
//! prompts. The runtime only catalogs them: each descriptor records where
//! the skill lives, which root it came from, and a SHA-256 content hash so
//! clients can cheaply detect edits.
//!
//! Descriptors come from two sets of roots. Project roots shadow user
//! roots on name collision: a repository-local skill overrides the
//! personal one of the same name.

use crate::worldllm::ids::to_kebab_case;
use lazy_static::lazy_static;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// Which root set a skill came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkillScope {
    User,
    Project,
}

/// One cataloged skill.
#[derive(Debug, Clone)]
pub struct SkillDescriptor {
    /// Kebab-case name derived from the directory or file stem.
    pub name: String,
    /// First non-heading line of the document, when present.
    pub description: Option<String>,
    pub path: PathBuf,
    pub scope: SkillScope,
    /// Lowercase hex SHA-256 of the document bytes.
    pub content_hash: String,
}

fn hash_content(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

fn first_description_line(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with("---"))
        .map(|line| line.to_string())
}

fn descriptor_from_file(path: &Path, name: &str, scope: SkillScope) -> Option<SkillDescriptor> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            log::warn!("skill file {} unreadable: {}", path.display(), e);
            return None;
        }
    };
    let content = String::from_utf8_lossy(&bytes);
    Some(SkillDescriptor {
        name: to_kebab_case(name),
        description: first_description_line(&content),
        path: path.to_path_buf(),
        scope,
        content_hash: hash_content(&bytes),
    })
}

/// Scan one root: `<root>/<dir>/SKILL.md` entries and loose `<root>/*.md`
/// files. Non-existent roots are skipped silently.
fn scan_root(root: &Path, scope: SkillScope, into: &mut HashMap<String, SkillDescriptor>) {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let descriptor = if path.is_dir() {
            let manifest = path.join("SKILL.md");
            if !manifest.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            descriptor_from_file(&manifest, &name, scope)
        } else if path.extension().and_then(|e| e.to_str()) == Some("md") {
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem.to_string(),
                None => continue,
            };
            descriptor_from_file(&path, &stem, scope)
        } else {
            None
        };
        if let Some(descriptor) = descriptor {
            into.insert(descriptor.name.clone(), descriptor);
        }
    }
}

/// Build the catalog from user and project roots. Later roots within a set
/// win on collision; project roots win over user roots.
pub fn sync_skills(user_roots: &[String], project_roots: &[String]) -> Vec<SkillDescriptor> {
    let mut catalog: HashMap<String, SkillDescriptor> = HashMap::new();
    for root in user_roots {
        scan_root(Path::new(root), SkillScope::User, &mut catalog);
    }
    for root in project_roots {
        scan_root(Path::new(root), SkillScope::Project, &mut catalog);
    }
    let mut skills: Vec<SkillDescriptor> = catalog.into_values().collect();
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

lazy_static! {
    static ref SKILL_REGISTRY: RwLock<HashMap<String, SkillDescriptor>> =
        RwLock::new(HashMap::new());
}

/// Re-scan the configured roots into the process-wide registry.
pub fn sync_skill_registry(user_roots: &[String], project_roots: &[String]) -> usize {
    let skills = sync_skills(user_roots, project_roots);
    let count = skills.len();
    let mut registry = SKILL_REGISTRY.write().unwrap();
    registry.clear();
    for skill in skills {
        registry.insert(skill.name.clone(), skill);
    }
    log::info!("skill registry synced: {} skills", count);
    count
}

pub fn get_skill(name: &str) -> Option<SkillDescriptor> {
    SKILL_REGISTRY.read().unwrap().get(&to_kebab_case(name)).cloned()
}

pub fn list_skills() -> Vec<SkillDescriptor> {
    let mut skills: Vec<SkillDescriptor> =
        SKILL_REGISTRY.read().unwrap().values().cloned().collect();
    skills.sort_by(|a, b| a.name.cmp(&b.name));
    skills
}

/// Empty the global registry so tests start from a known state.
pub fn clear_skill_registry_for_tests() {
    SKILL_REGISTRY.write().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_skill(root: &Path, dir: &str, body: &str) {
        let skill_dir = root.join(dir);
        fs::create_dir_all(&skill_dir).unwrap();
        fs::write(skill_dir.join("SKILL.md"), body).unwrap();
    }

    #[test]
    fn scans_directories_and_loose_files() {
        let root = tempfile::tempdir().unwrap();
        write_skill(root.path(), "Deploy Steps", "# Deploy\nRuns the deploy.\n");
        fs::write(root.path().join("review.md"), "# Review\nChecklist for PRs.\n").unwrap();

        let skills = sync_skills(&[root.path().display().to_string()], &[]);
        let names: Vec<&str> = skills.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["deploy-steps", "review"]);
        assert_eq!(
            skills[0].description.as_deref(),
            Some("Runs the deploy.")
        );
        assert_eq!(skills[0].scope, SkillScope::User);
    }

    #[test]
    fn project_roots_shadow_user_roots() {
        let user = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        write_skill(user.path(), "deploy", "# Deploy\nUser version.\n");
        write_skill(project.path(), "deploy", "# Deploy\nProject version.\n");

        let skills = sync_skills(
            &[user.path().display().to_string()],
            &[project.path().display().to_string()],
        );
        assert_eq!(skills.len(), 1);
        assert_eq!(skills[0].scope, SkillScope::Project);
        assert_eq!(skills[0].description.as_deref(), Some("Project version."));
    }

    #[test]
    fn content_hash_tracks_edits() {
        let root = tempfile::tempdir().unwrap();
        write_skill(root.path(), "deploy", "version one");
        let before = sync_skills(&[root.path().display().to_string()], &[]);

        write_skill(root.path(), "deploy", "version two");
        let after = sync_skills(&[root.path().display().to_string()], &[]);

        assert_ne!(before[0].content_hash, after[0].content_hash);
        assert_eq!(before[0].content_hash.len(), 64);
    }

    #[test]
    fn missing_roots_are_ignored() {
        let skills = sync_skills(&["/nonexistent/skills".to_string()], &[]);
        assert!(skills.is_empty());
    }
}
