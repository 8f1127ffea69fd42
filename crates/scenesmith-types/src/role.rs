use serde::{Deserialize, Serialize};

/// Closed set of agent roles that drive the workflow's stage DAG.
///
/// This spec treats role assignment as a single unified set rather than
/// splitting "builder-family" and "finishing-family" roles, so every stage
/// transition is expressed against one enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Concept,
    Builder,
    Texture,
    Lighting,
    Validator,
    RenderSetup,
    Animation,
    Reviewer,
    Save,
}

impl Role {
    pub const ALL: [Role; 9] = [
        Role::Concept,
        Role::Builder,
        Role::Texture,
        Role::Lighting,
        Role::Validator,
        Role::RenderSetup,
        Role::Animation,
        Role::Save,
        Role::Reviewer,
    ];

    /// Fixed stage ordinal used for artifact filenames and deterministic
    /// script concatenation order. Texture and Lighting share an ordinal
    /// because they run as parallel siblings; ties are broken by role name.
    pub fn stage_ordinal(self) -> u8 {
        match self {
            Role::Concept => 0,
            Role::Builder => 1,
            Role::Texture => 2,
            Role::Lighting => 2,
            Role::Validator => 3,
            Role::RenderSetup => 4,
            Role::Animation => 5,
            Role::Save => 6,
            Role::Reviewer => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Concept => "concept",
            Role::Builder => "builder",
            Role::Texture => "texture",
            Role::Lighting => "lighting",
            Role::Validator => "validator",
            Role::RenderSetup => "render_setup",
            Role::Animation => "animation",
            Role::Reviewer => "reviewer",
            Role::Save => "save",
        }
    }

    /// Whether this role's stage runs as a parallel sibling of another role
    /// at the same ordinal (currently only texture/lighting).
    pub fn is_parallel_sibling_of(self, other: Role) -> bool {
        self != other && self.stage_ordinal() == other.stage_ordinal()
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inverse of `as_str`, so roles can round-trip through CLI arguments and
/// query strings the way they already do through JSON.
impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concept" => Ok(Role::Concept),
            "builder" => Ok(Role::Builder),
            "texture" => Ok(Role::Texture),
            "lighting" => Ok(Role::Lighting),
            "validator" => Ok(Role::Validator),
            "render_setup" => Ok(Role::RenderSetup),
            "animation" => Ok(Role::Animation),
            "reviewer" => Ok(Role::Reviewer),
            "save" => Ok(Role::Save),
            other => Err(format!("unknown role `{other}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_and_lighting_share_an_ordinal() {
        assert_eq!(Role::Texture.stage_ordinal(), Role::Lighting.stage_ordinal());
        assert!(Role::Texture.is_parallel_sibling_of(Role::Lighting));
    }

    #[test]
    fn as_str_and_from_str_round_trip_for_every_role() {
        for role in Role::ALL {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
    }

    #[test]
    fn ordinals_are_non_decreasing_in_declared_order() {
        let mut last = 0u8;
        for role in Role::ALL {
            assert!(role.stage_ordinal() >= last);
            last = role.stage_ordinal();
        }
    }
}
