use serde::{Deserialize, Serialize};

use crate::role::Role;

/// The kind of file an artifact write represents, used both for the
/// recovery heuristic (presence of a render + blend file implies a
/// completed session) and for the `GET /download/{id}/{kind}` surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Script,
    Blend,
    Render,
    Log,
}

impl ArtifactKind {
    pub fn extension(self) -> &'static str {
        match self {
            ArtifactKind::Script => "py",
            ArtifactKind::Blend => "blend",
            ArtifactKind::Render => "png",
            ArtifactKind::Log => "log",
        }
    }
}

/// Metadata recorded alongside each artifact written to a session's
/// directory. The artifact bytes themselves are not modeled here; the
/// Artifact Store writes them directly to disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactMeta {
    pub kind: ArtifactKind,
    pub role: Option<Role>,
    pub stage_ordinal: Option<u8>,
    pub iteration: u32,
    pub relative_path: String,
    pub bytes_written: u64,
    pub written_at: chrono::DateTime<chrono::Utc>,
}

/// Filename for a stage script, deterministic by construction so that
/// concatenation order never depends on write order.
pub fn stage_script_filename(role: Role, iteration: u32) -> String {
    format!("{:02}_{}_iter{}.py", role.stage_ordinal(), role.as_str(), iteration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_filenames_sort_by_ordinal_then_name() {
        let mut names = vec![
            stage_script_filename(Role::Lighting, 1),
            stage_script_filename(Role::Builder, 1),
            stage_script_filename(Role::Texture, 1),
            stage_script_filename(Role::Concept, 1),
        ];
        names.sort();
        assert_eq!(
            names,
            vec![
                "00_concept_iter1.py",
                "01_builder_iter1.py",
                "02_lighting_iter1.py",
                "02_texture_iter1.py",
            ]
        );
    }
}
