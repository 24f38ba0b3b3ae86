//! Generated registry module and the seed entry point.

use std::fmt::Write as _;

use super::bundler::lua_string;

pub const ENTRY_PATH: &str = "/src/main.lua";
pub const REGISTRY_PATH: &str = "/src/registry.lua";

pub const SEED_MAIN: &str = r#"-- Entry point. Component modules are collected by ./registry.
return { components = require("./registry") }
"#;

/// Registry source mapping each component id to its module.
pub fn generate_registry(ids: &[String]) -> String {
    let mut ids = ids.to_vec();
    ids.sort();
    ids.dedup();

    let mut text = String::from("-- Generated. Rewritten on every authoring change.\nreturn {\n");
    for id in &ids {
        let spec = format!("./components/{id}");
        let _ = writeln!(text, "  [{}] = require({}),", lua_string(id), lua_string(&spec));
    }
    text.push_str("}\n");
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::bundler::scan_requires;

    #[test]
    fn empty_registry_is_an_empty_table() {
        assert!(generate_registry(&[]).ends_with("return {\n}\n"));
    }

    #[test]
    fn registry_requires_each_component_once() {
        let text = generate_registry(&["todo".into(), "clock".into(), "todo".into()]);
        assert_eq!(
            scan_requires(&text),
            vec!["./components/clock", "./components/todo"]
        );
        assert!(text.contains("[\"todo\"] = require(\"./components/todo\")"));
    }

    #[test]
    fn seed_main_requires_registry() {
        assert_eq!(scan_requires(SEED_MAIN), vec!["./registry"]);
    }
}
