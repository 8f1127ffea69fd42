use scenesmith_types::Role;

/// Groups the session's enabled roles into ordinal-ordered stages, keeping
/// same-ordinal roles (Texture/Lighting) together as one parallel fan-out
/// group. The Reviewer never appears here: it runs once, after the combined
/// script has executed, not as part of script assembly (spec.md §4.6).
pub fn producing_stage_groups(enabled: &[Role]) -> Vec<Vec<Role>> {
    let mut groups: Vec<Vec<Role>> = Vec::new();
    let mut last_ordinal: Option<u8> = None;
    for role in Role::ALL {
        if role == Role::Reviewer || !enabled.contains(&role) {
            continue;
        }
        let ordinal = role.stage_ordinal();
        if last_ordinal == Some(ordinal) {
            groups.last_mut().expect("ordinal repeats only after a first group exists").push(role);
        } else {
            groups.push(vec![role]);
            last_ordinal = Some(ordinal);
        }
    }
    groups
}

/// `groups`, minus the Concept stage — refinement iterations rerun from
/// Builder, not Concept (spec.md §4.6), since the concept document doesn't
/// change between iterations.
pub fn refinement_stage_groups(groups: &[Vec<Role>]) -> Vec<Vec<Role>> {
    groups.iter().filter(|group| !group.contains(&Role::Concept)).cloned().collect()
}
