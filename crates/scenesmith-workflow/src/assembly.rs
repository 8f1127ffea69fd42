use scenesmith_types::{Config, Role};

/// Bootstrap header prepended to every combined script: resets the scene and
/// wires in the render/animation parameters drawn from the environment
/// (spec.md §6's `RENDER_*`/`ANIMATION_*` variables), so per-stage fragments
/// never need to know about render settings themselves.
pub fn bootstrap_header(config: &Config, iteration: u32, render_path: &str) -> String {
    let mut header = String::new();
    header.push_str("import bpy\n\n");
    header.push_str("bpy.ops.wm.read_factory_settings(use_empty=True)\n");
    header.push_str(&format!("bpy.context.scene.render.engine = {:?}\n", config.render_engine));
    header.push_str(&format!("bpy.context.scene.cycles.samples = {}\n", config.render_samples));
    header.push_str(&format!(
        "bpy.context.scene.render.resolution_x = {}\n",
        config.render_resolution_x
    ));
    header.push_str(&format!(
        "bpy.context.scene.render.resolution_y = {}\n",
        config.render_resolution_y
    ));
    header.push_str(&format!("bpy.context.scene.render.filepath = {render_path:?}\n"));
    if config.animation_enabled {
        header.push_str(&format!("bpy.context.scene.frame_end = {}\n", config.animation_frames));
        header.push_str(&format!("bpy.context.scene.render.fps = {}\n", config.animation_fps));
    }
    header.push_str(&format!("# iteration {iteration}\n\n"));
    header
}

/// Concatenates per-stage fragments in stage-ordinal order (ties broken by
/// role name), preceded by the bootstrap header, satisfying spec.md §8
/// property 3.
pub fn assemble_combined_script(header: &str, fragments: &[(Role, String)]) -> String {
    let mut ordered = fragments.to_vec();
    ordered.sort_by_key(|(role, _)| (role.stage_ordinal(), role.as_str()));

    let mut out = String::new();
    out.push_str(header);
    for (role, fragment) in ordered {
        out.push_str(&format!("# --- {} ---\n", role.as_str()));
        out.push_str(&fragment);
        if !fragment.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
    }
    out.push_str("bpy.ops.render.render(write_still=True)\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragments_concatenate_in_ordinal_order_regardless_of_input_order() {
        let header = "# header\n";
        let fragments = vec![
            (Role::Save, "save_fragment()".to_string()),
            (Role::Concept, "concept_fragment()".to_string()),
            (Role::Builder, "builder_fragment()".to_string()),
        ];
        let combined = assemble_combined_script(header, &fragments);
        let concept_pos = combined.find("concept_fragment").unwrap();
        let builder_pos = combined.find("builder_fragment").unwrap();
        let save_pos = combined.find("save_fragment").unwrap();
        assert!(concept_pos < builder_pos);
        assert!(builder_pos < save_pos);
    }

    #[test]
    fn parallel_siblings_break_ties_alphabetically_by_role_name() {
        let fragments = vec![(Role::Texture, "tex()".to_string()), (Role::Lighting, "light()".to_string())];
        let combined = assemble_combined_script("", &fragments);
        // "lighting" < "texture" lexicographically, so Lighting's fragment comes first.
        assert!(combined.find("light()").unwrap() < combined.find("tex()").unwrap());
    }
}
